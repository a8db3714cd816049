//! REST dependency
//!
//! The single endpoint this client consumes: `GET /gateway/bot`, which
//! advertises the gateway URL, the recommended shard count, and the
//! session start limit the identify queue budgets against.

use crate::error::GatewayError;
use crate::protocol::SessionStartLimit;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://discord.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway metadata returned by `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
    /// Recommended shard count for this token.
    pub shards: u64,
    pub session_start_limit: SessionStartLimit,
}

/// Minimal REST client owned by the manager. Shards never talk REST.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl RestClient {
    pub fn new(token: impl Into<String>, gateway_version: u8) -> Result<Self, GatewayError> {
        Self::with_base(
            token,
            format!("{DEFAULT_API_BASE}/v{gateway_version}"),
        )
    }

    pub fn with_base(token: impl Into<String>, base: impl Into<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GatewayError::Rest)?;
        Ok(Self {
            http,
            base: base.into(),
            token: token.into(),
        })
    }

    /// Fetch gateway metadata. Called before every identify admission.
    pub async fn gateway_bot(&self) -> Result<GatewayInfo, GatewayError> {
        let url = format!("{}/gateway/bot", self.base);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(GatewayError::Rest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::RestStatus {
                status: status.as_u16(),
            });
        }

        let info: GatewayInfo = response.json().await.map_err(GatewayError::Rest)?;
        debug!(
            shards = info.shards,
            remaining = info.session_start_limit.remaining,
            reset_after = info.session_start_limit.reset_after,
            "Fetched gateway metadata"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_info_parses_the_documented_shape() {
        let raw = r#"{
            "url": "wss://gateway.discord.gg",
            "shards": 9,
            "session_start_limit": {
                "total": 1000,
                "remaining": 999,
                "reset_after": 14400000,
                "max_concurrency": 1
            }
        }"#;

        let info: GatewayInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.url, "wss://gateway.discord.gg");
        assert_eq!(info.shards, 9);
        assert_eq!(info.session_start_limit.remaining, 999);
        assert_eq!(info.session_start_limit.reset_after, 14_400_000);
    }
}
