//! Shard connection runtime
//!
//! One shard owns one framed gateway connection end-to-end: handshake,
//! identify/resume, heartbeats, dispatch pumping, and close handling.

mod runtime;
mod session;
mod state;

pub use runtime::{ShardConfig, ShardRuntime};
pub use session::{Heartbeat, SendRateGuard, Session};
pub use state::{FleetState, ShardStatus};
