//! Control channel messages
//!
//! The typed, ordered, lossless contract between the manager and one shard
//! runtime. Control signals flow manager -> shard only; status, debug, and
//! dispatch flow shard -> manager. Delivery is exactly-once because the
//! transport is an in-process channel; nothing survives a shard restart.

use crate::protocol::{DispatchEvent, GatewayPayload};
use crate::shard::{Session, ShardStatus};

/// Outcome of an admitted identify, reported back to the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Ready,
    InvalidSession,
}

/// A payload with an explicit routing target, used when one shard hands an
/// outbound payload to the manager for delivery on another shard.
#[derive(Debug, Clone)]
pub struct OutboundPayload {
    pub shard_id: u64,
    pub payload: GatewayPayload,
}

/// Shard -> manager messages.
#[derive(Debug)]
pub enum ShardMessage {
    /// Human-readable diagnostics, already token-redacted
    Debug(String),
    /// A dispatch to fan out to subscribers
    Dispatch(DispatchEvent),
    /// Request identify admission
    Identify,
    /// Re-request admission after session invalidation
    ScheduleIdentify,
    /// Latest heartbeat round-trip in milliseconds
    UpdatePing(u64),
    /// Reply to an admitted identify
    GatewayStatus(GatewayStatus),
    /// Lifecycle status change
    ConnectionStatusUpdate(ShardStatus),
    /// Terminal failure; the manager decides whether to respawn
    CannotReconnect { code: u16, reason: String },
    /// Outbound payload for the manager to route to its target shard
    PayloadDispatch(OutboundPayload),
    /// Session snapshot, answering a manager FetchSessionData
    FetchSessionData(Option<Session>),
}

/// Manager -> shard messages.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Admission granted: send the identify payload now
    Identify,
    /// Tear down, preserve the session, and exit for respawn
    Reconnect,
    /// Tear down, discard the session, and exit for good
    Destroy,
    /// Enqueue an outbound payload on this shard
    PayloadDispatch(GatewayPayload),
    /// Request a session snapshot
    FetchSessionData,
}

/// A shard message tagged with its origin, as delivered to the manager's
/// inbox by the per-shard forwarder.
#[derive(Debug)]
pub struct ShardFrame {
    pub shard_id: u64,
    pub message: ShardMessage,
}
