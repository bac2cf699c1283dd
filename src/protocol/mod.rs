//! Protocol message types.
//!
//! This module defines the records exchanged between peers, the
//! orchestrator and the session worker.
//!
//! # Protocol Overview
//!
//! | Message Type | Travels Over | Purpose |
//! |--------------|--------------|---------|
//! | `RawPacket` | peer links | Decoded protocol message |
//! | `Envelope` | worker link | Channel-tagged payload |
//! | `PipelineMessage` | `internal.proxy` channel | Packet plus direction |
//! | `Packet` | in-process | Mutable packet under dispatch |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope and pipeline payload |
//! | `packet` | Packet, direction and protocol state |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope and pipeline payload types.
pub mod envelope;

/// Packet value types.
pub mod packet;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{Envelope, PROXY_CHANNEL, PipelineMessage};
pub use packet::{Direction, Packet, ProtocolState, RawPacket};
