//! Packet value types.
//!
//! A [`RawPacket`] is the decoded protocol message as it crosses a link.
//! A [`Packet`] is the same message while it is being dispatched: handlers
//! receive `&mut Packet`, may edit it, and may cancel it.
//!
//! # Format
//!
//! ```json
//! { "name": "chat", "data": { "message": "hi" }, "state": "play" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Direction
// ============================================================================

/// Traffic direction of a packet.
///
/// Fixed when the packet is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to target.
    Upstream,
    /// Target to client.
    Downstream,
}

impl Direction {
    /// Both directions, upstream first.
    pub const ALL: [Direction; 2] = [Direction::Upstream, Direction::Downstream];

    /// Returns the wire name of the direction.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }

    /// Returns the opposite direction.
    #[inline]
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Upstream => Self::Downstream,
            Self::Downstream => Self::Upstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ProtocolState
// ============================================================================

/// Connection state a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolState {
    /// Initial handshake.
    Handshaking,
    /// Server list ping.
    Status,
    /// Login sequence.
    Login,
    /// Configuration phase.
    Configuration,
    /// In-game traffic.
    Play,
}

// ============================================================================
// RawPacket
// ============================================================================

/// A decoded protocol message as carried over links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    /// Packet name.
    pub name: String,

    /// Packet payload.
    #[serde(default)]
    pub data: Value,

    /// Protocol state, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ProtocolState>,
}

impl RawPacket {
    /// Creates a raw packet.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value, state: Option<ProtocolState>) -> Self {
        Self {
            name: name.into(),
            data,
            state,
        }
    }
}

impl From<Packet> for RawPacket {
    fn from(packet: Packet) -> Self {
        Self {
            name: packet.name,
            data: packet.data,
            state: packet.state,
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A packet under dispatch.
///
/// Handlers share one mutable packet in registration order, so edits made by
/// one handler are visible to the next. Once canceled, a packet stays
/// canceled.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet name. Named handlers are selected by this value.
    pub name: String,

    /// Packet payload.
    pub data: Value,

    /// Protocol state, if known.
    pub state: Option<ProtocolState>,

    canceled: bool,
}

impl Packet {
    /// Creates a pending packet.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value, state: Option<ProtocolState>) -> Self {
        Self {
            name: name.into(),
            data,
            state,
            canceled: false,
        }
    }

    /// Marks the packet as canceled. It will not be forwarded.
    #[inline]
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    /// Returns `true` if a handler canceled this packet.
    #[inline]
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Returns a field of an object payload.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Sets a field of the payload.
    ///
    /// A non-object payload is replaced by an object holding only `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if !self.data.is_object() {
            self.data = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(key.into(), value.into());
        }
    }
}

impl From<RawPacket> for Packet {
    fn from(raw: RawPacket) -> Self {
        Self::new(raw.name, raw.data, raw.state)
    }
}

// ============================================================================
// Tests
// ============================================================================
