//! Caladan Gateway - sharded gateway client for a real-time chat platform
//!
//! Maintains N persistent framed connections ("shards") to the chat
//! gateway while presenting consumers with a single logical event stream:
//! - Per-shard protocol runtime: handshake, identify/resume, heartbeats,
//!   close-code handling
//! - Manager-level identify admission queue honoring the session start
//!   limit
//! - Typed subscription surface over dispatch event names
//! - Prometheus metrics and health endpoints for the bundled binary

pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod rest;
pub mod shard;

pub use config::{GatewayConfig, ShardMode};
pub use error::{ErrorKind, GatewayError};
pub use manager::{MetaEvent, ShardEvent, ShardManager};
pub use metrics::GatewayMetrics;
pub use protocol::{DispatchEvent, EventType, GatewayPayload};
pub use shard::{FleetState, Session, ShardStatus};
