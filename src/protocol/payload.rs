//! Gateway payload envelope and the typed bodies this client sends/receives
//!
//! Every frame is a JSON object `{ op, s?, t?, d }`. Inbound payloads keep
//! `d` as raw JSON until the opcode (and for dispatches the event name)
//! selects a concrete body type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::opcode::OpCode;

/// The `{ op, s?, t?, d }` envelope shared by every gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op,
            s: None,
            t: None,
            d,
        }
    }

    /// Heartbeat carries the last observed sequence, or null before the
    /// first numbered dispatch.
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self::new(
            OpCode::Heartbeat,
            seq.map(Into::into).unwrap_or(Value::Null),
        )
    }

    pub fn identify(identify: &Identify) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Identify, serde_json::to_value(identify)?))
    }

    pub fn resume(resume: &Resume) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Resume, serde_json::to_value(resume)?))
    }

    /// Presence update (op 3). The body is caller-shaped.
    pub fn status_update(d: Value) -> Self {
        Self::new(OpCode::StatusUpdate, d)
    }

    /// Guild member chunk request (op 8). The body is caller-shaped.
    pub fn request_guild_members(d: Value) -> Self {
        Self::new(OpCode::RequestGuildMembers, d)
    }
}

/// Connection properties reported in the identify payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Body of the identify payload (op 2).
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: u64,
    /// `[shard_id, total_shards]`
    pub shard: [u64; 2],
    pub large_threshold: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// Body of the resume payload (op 6).
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Body of the HELLO payload (op 10).
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The subset of the READY dispatch this client consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
}

/// Identify budget advertised by `GET /gateway/bot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until `remaining` resets to `total`.
    pub reset_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_with_no_sequence_is_null() {
        let json = serde_json::to_string(&GatewayPayload::heartbeat(None)).unwrap();
        assert_eq!(json, r#"{"op":1,"d":null}"#);
    }

    #[test]
    fn heartbeat_carries_sequence() {
        let json = serde_json::to_string(&GatewayPayload::heartbeat(Some(42))).unwrap();
        assert_eq!(json, r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn identify_shape_matches_wire_contract() {
        let identify = Identify {
            token: "t".to_string(),
            properties: IdentifyProperties {
                os: "linux".to_string(),
                browser: "caladan".to_string(),
                device: "caladan".to_string(),
            },
            intents: 513,
            shard: [2, 8],
            large_threshold: 250,
            presence: None,
        };

        let payload = GatewayPayload::identify(&identify).unwrap();
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["shard"], serde_json::json!([2, 8]));
        assert_eq!(value["d"]["intents"], 513);
        assert_eq!(value["d"]["large_threshold"], 250);
        assert!(value["d"].get("presence").is_none());
    }

    #[test]
    fn envelope_parses_numbered_dispatch() {
        let raw = r#"{"op":0,"s":7,"t":"MESSAGE_CREATE","d":{"id":"123"}}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).unwrap();

        assert_eq!(payload.op, OpCode::Dispatch);
        assert_eq!(payload.s, Some(7));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(payload.d["id"], "123");
    }

    #[test]
    fn envelope_tolerates_missing_d() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.op, OpCode::HeartbeatAck);
        assert!(payload.d.is_null());
    }
}
