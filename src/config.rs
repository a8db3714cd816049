//! Gateway configuration module
//!
//! Handles programmatic construction and loading from environment
//! variables.

use crate::error::GatewayError;
use crate::protocol::IdentifyProperties;
use serde_json::Value;
use std::env;

/// Default large_threshold; the gateway accepts 50..=250.
pub const DEFAULT_LARGE_THRESHOLD: u16 = 250;

/// Outbound payloads queued per shard before the shard treats itself as
/// zombied and reconnects.
pub const DEFAULT_SEND_QUEUE_HIGH_WATER: usize = 2048;

/// How the shard list is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardMode {
    /// Use the shard count recommended by `GET /gateway/bot`.
    Auto,
    /// Run shards `0..n` with `total_shards = n`.
    Count(u64),
    /// Run exactly these ids; `total_shards` must be set separately.
    List(Vec<u64>),
}

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot token. Never logged; debug output is redacted before emission.
    pub token: String,

    /// Shard selection: auto, a count, or an explicit id list
    pub shards: ShardMode,

    /// Total shards across all processes. Required with `ShardMode::List`.
    pub total_shards: Option<u64>,

    /// Gateway intent bitfield
    pub intents: u64,

    /// Gateway protocol version used in the connection URL
    pub gateway_version: u8,

    /// Member-list threshold sent in identify (50..=250)
    pub large_threshold: u16,

    /// Initial presence sent in identify, caller-shaped
    pub presence: Option<Value>,

    /// Connection properties sent in identify
    pub properties: IdentifyProperties,

    /// Health/metrics HTTP port (binary only)
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Per-shard outbound queue high-water mark
    pub send_queue_high_water: usize,
}

impl GatewayConfig {
    /// Build a configuration with defaults for everything but the token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            shards: ShardMode::Auto,
            total_shards: None,
            intents: 0,
            gateway_version: 10,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            presence: None,
            properties: IdentifyProperties::default(),
            http_port: 9090,
            log_level: "info".to_string(),
            send_queue_high_water: DEFAULT_SEND_QUEUE_HIGH_WATER,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let token = env::var("DISCORD_TOKEN").map_err(|_| GatewayError::MissingToken)?;

        let shards = match env::var("SHARDS") {
            Err(_) => ShardMode::Auto,
            Ok(raw) => parse_shard_mode(&raw)?,
        };

        let total_shards = match env::var("TOTAL_SHARDS") {
            Err(_) => None,
            Ok(raw) => Some(raw.parse().map_err(|e| {
                GatewayError::Config(format!("TOTAL_SHARDS must be a valid number: {e}"))
            })?),
        };

        let intents = env::var("INTENTS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("INTENTS must be a valid bitfield: {e}")))?;

        let gateway_version = env::var("GATEWAY_VERSION")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!("GATEWAY_VERSION must be a valid number: {e}"))
            })?;

        let large_threshold = match env::var("LARGE_THRESHOLD") {
            Err(_) => DEFAULT_LARGE_THRESHOLD,
            Ok(raw) => raw.parse().map_err(|e| {
                GatewayError::Config(format!("LARGE_THRESHOLD must be a valid number: {e}"))
            })?,
        };

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            token,
            shards,
            total_shards,
            intents,
            gateway_version,
            large_threshold,
            presence: None,
            properties: IdentifyProperties::default(),
            http_port,
            log_level,
            send_queue_high_water: DEFAULT_SEND_QUEUE_HIGH_WATER,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway would bounce at identify time.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.token.trim().is_empty() {
            return Err(GatewayError::MissingToken);
        }
        if !(50..=250).contains(&self.large_threshold) {
            return Err(GatewayError::Config(format!(
                "large_threshold must be within 50..=250, got {}",
                self.large_threshold
            )));
        }
        if let ShardMode::List(ids) = &self.shards {
            let total = self.total_shards.ok_or(GatewayError::ShardListWithoutTotal)?;
            if let Some(&bad) = ids.iter().find(|&&id| id >= total) {
                return Err(GatewayError::ShardIdOutOfRange {
                    shard_id: bad,
                    total,
                });
            }
        }
        if let ShardMode::Count(0) = self.shards {
            return Err(GatewayError::Config("shard count must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse the SHARDS value: `auto`, a count, or a comma-separated id list.
/// Non-numeric entries in a list are filtered out.
fn parse_shard_mode(raw: &str) -> Result<ShardMode, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("auto") {
        return Ok(ShardMode::Auto);
    }
    if !trimmed.contains(',') {
        return trimmed
            .parse()
            .map(ShardMode::Count)
            .map_err(|e| GatewayError::Config(format!("SHARDS must be auto, a count, or an id list: {e}")));
    }
    let ids: Vec<u64> = trimmed
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    if ids.is_empty() {
        return Err(GatewayError::Config(format!(
            "SHARDS list '{trimmed}' contains no numeric shard ids"
        )));
    }
    Ok(ShardMode::List(ids))
}
