//! Shard manager
//!
//! Owns the fleet: spawns shard runtimes, serializes identify admission
//! under the session start limit, routes outbound payloads, fans inbound
//! dispatches out to subscribers, and restarts shards on resumable failure.

mod fleet;
mod message;
mod queue;

pub use fleet::{MetaEvent, ShardEvent, ShardManager};
pub use message::{GatewayStatus, ManagerMessage, OutboundPayload, ShardFrame, ShardMessage};
pub use queue::admission_delay;
