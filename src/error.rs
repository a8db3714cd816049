//! Domain error types for the gateway client
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process
//! boundary). All application code returns Result<T, GatewayError>.

use thiserror::Error;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// No token supplied via configuration or DISCORD_TOKEN
    #[error("no gateway token: set DISCORD_TOKEN or supply one in the configuration")]
    MissingToken,

    /// An explicit shard list was given without total_shards
    #[error("explicit shard list requires total_shards to be set")]
    ShardListWithoutTotal,

    /// Shard identity out of range for the configured total
    #[error("shard id {shard_id} is out of range for total_shards {total}")]
    ShardIdOutOfRange { shard_id: u64, total: u64 },

    /// Fetching gateway metadata over REST failed
    #[error("gateway metadata request failed")]
    Rest(#[source] reqwest::Error),

    /// The REST API answered with a non-success status
    #[error("gateway metadata request returned status {status}")]
    RestStatus { status: u16 },

    /// The gateway rejected the token (close codes 4003/4004)
    #[error("shard {shard_id} authentication rejected (close code {code})")]
    AuthFailed { shard_id: u64, code: u16 },

    /// The gateway rejected the identify configuration (close codes 4010-4014)
    #[error("shard {shard_id} configuration rejected (close code {code}): {reason}")]
    ConfigRejected {
        shard_id: u64,
        code: u16,
        reason: String,
    },

    /// A shard's control channel closed without an orderly shutdown
    #[error("shard {shard_id} control channel closed unexpectedly")]
    ControlChannelClosed { shard_id: u64 },

    /// A send was routed to a shard id the manager does not own
    #[error("no shard {shard_id} in this fleet")]
    UnknownShard { shard_id: u64 },

    /// Payload serialization failed
    #[error("payload serialization failed on shard {shard_id}")]
    Serialization {
        shard_id: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Coarse failure classification surfaced through the `error` meta event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing token, bad shard configuration, REST failure during spawn
    Startup,
    /// Close codes 4003/4004
    Auth,
    /// Close codes 4010-4014
    Config,
    /// Recoverable transport or serialization trouble
    Transient,
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::MissingToken => "missing_token",
            Self::ShardListWithoutTotal => "shard_list_without_total",
            Self::ShardIdOutOfRange { .. } => "shard_id_out_of_range",
            Self::Rest(_) => "rest",
            Self::RestStatus { .. } => "rest_status",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ConfigRejected { .. } => "config_rejected",
            Self::ControlChannelClosed { .. } => "control_channel_closed",
            Self::UnknownShard { .. } => "unknown_shard",
            Self::Serialization { .. } => "serialization",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::MissingToken
            | Self::ShardListWithoutTotal
            | Self::ShardIdOutOfRange { .. }
            | Self::Rest(_)
            | Self::RestStatus { .. } => ErrorKind::Startup,
            Self::AuthFailed { .. } => ErrorKind::Auth,
            Self::ConfigRejected { .. } => ErrorKind::Config,
            Self::ControlChannelClosed { .. }
            | Self::UnknownShard { .. }
            | Self::Serialization { .. } => ErrorKind::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serde_error() -> serde_json::Error {
        serde_json::from_str::<()>("invalid").unwrap_err()
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::Config("test".to_string()).error_type_label(),
            GatewayError::MissingToken.error_type_label(),
            GatewayError::ShardListWithoutTotal.error_type_label(),
            GatewayError::ShardIdOutOfRange {
                shard_id: 9,
                total: 4,
            }
            .error_type_label(),
            GatewayError::RestStatus { status: 401 }.error_type_label(),
            GatewayError::AuthFailed {
                shard_id: 0,
                code: 4004,
            }
            .error_type_label(),
            GatewayError::ConfigRejected {
                shard_id: 0,
                code: 4014,
                reason: "disallowed intents".to_string(),
            }
            .error_type_label(),
            GatewayError::ControlChannelClosed { shard_id: 2 }.error_type_label(),
            GatewayError::UnknownShard { shard_id: 7 }.error_type_label(),
            GatewayError::Serialization {
                shard_id: 0,
                source: serde_error(),
            }
            .error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "duplicate error_type_label");
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::AuthFailed {
            shard_id: 3,
            code: 4004,
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"));
        assert!(msg.contains("4004"));

        let err = GatewayError::ShardIdOutOfRange {
            shard_id: 9,
            total: 4,
        };
        assert!(err.to_string().contains('9'));
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn fatal_close_codes_map_to_fatal_kinds() {
        assert_eq!(
            GatewayError::AuthFailed {
                shard_id: 0,
                code: 4003
            }
            .kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            GatewayError::ConfigRejected {
                shard_id: 0,
                code: 4013,
                reason: "invalid intents".to_string()
            }
            .kind(),
            ErrorKind::Config
        );
        assert_eq!(GatewayError::MissingToken.kind(), ErrorKind::Startup);
    }
}
