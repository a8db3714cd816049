//! Gateway wire protocol
//!
//! Opcode-level payload types and the close-code policy for the chat
//! gateway's framed JSON protocol.

pub mod close;
pub mod event;
mod opcode;
mod payload;

pub use close::CloseAction;
pub use event::{DispatchEvent, EventType};
pub use opcode::OpCode;
pub use payload::{
    GatewayPayload, Hello, Identify, IdentifyProperties, Ready, Resume, SessionStartLimit,
};
