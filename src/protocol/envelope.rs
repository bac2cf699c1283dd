//! Transport envelope types.
//!
//! # Envelope
//!
//! Every message crossing the orchestrator/worker link is wrapped in an
//! [`Envelope`] naming its channel:
//!
//! ```json
//! { "channel": "internal.proxy", "data": { ... } }
//! ```
//!
//! # Pipeline Message
//!
//! The interception pipeline's channel carries [`PipelineMessage`]:
//!
//! ```json
//! { "direction": "upstream", "packet": { "name": "chat", "data": {} } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::packet::{Direction, RawPacket};

// ============================================================================
// Constants
// ============================================================================

/// Channel id used by the interception pipeline.
pub const PROXY_CHANNEL: &str = "internal.proxy";

// ============================================================================
// Envelope
// ============================================================================

/// Wire unit of the channel transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Id of the channel this message belongs to.
    pub channel: String,

    /// Channel-specific payload.
    pub data: Value,
}

impl Envelope {
    /// Creates an envelope.
    #[inline]
    #[must_use]
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }
}

// ============================================================================
// PipelineMessage
// ============================================================================

/// Payload of the interception pipeline channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMessage {
    /// Direction of the packet.
    pub direction: Direction,

    /// The packet itself.
    pub packet: RawPacket,
}

impl PipelineMessage {
    /// Creates a pipeline message.
    #[inline]
    #[must_use]
    pub fn new(direction: Direction, packet: RawPacket) -> Self {
        Self { direction, packet }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_envelope_format() {
        let envelope = Envelope::new("a", json!(1));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({ "channel": "a", "data": 1 }));
    }

    #[test]
    fn test_pipeline_message_format() {
        let message = PipelineMessage::new(
            Direction::Upstream,
            RawPacket::new("chat", json!({ "message": "hi" }), None),
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "direction": "upstream",
                "packet": { "name": "chat", "data": { "message": "hi" } }
            })
        );
    }

    #[test]
    fn test_pipeline_message_parses_state() {
        let text = r#"{"direction":"downstream","packet":{"name":"login_success","data":{},"state":"login"}}"#;
        let message: PipelineMessage = serde_json::from_str(text).unwrap();
        assert_eq!(message.direction, Direction::Downstream);
        assert_eq!(message.packet.name, "login_success");
    }
}
