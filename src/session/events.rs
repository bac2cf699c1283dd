//! Session events.
//!
//! A session publishes what happens to it on a broadcast channel so the
//! host can react. The core never retries or reconnects on its own.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::identifiers::{ModuleId, SessionId};
use crate::pipeline::HandlerFault;
use crate::plugin::LoadReport;
use crate::protocol::Direction;

use super::teardown::TeardownReason;

// ============================================================================
// Constants
// ============================================================================

/// Capacity of each session's event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

// ============================================================================
// SessionEvent
// ============================================================================

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The worker thread is online.
    WorkerOnline {
        /// Session id.
        session_id: SessionId,
        /// Time from spawn to online.
        startup: Duration,
    },
    /// A plugin load pass finished.
    PluginsLoaded {
        /// Session id.
        session_id: SessionId,
        /// Load pass result.
        report: LoadReport,
    },
    /// A plugin entry failed and loading continued.
    PluginError {
        /// Session id.
        session_id: SessionId,
        /// Failing entry.
        module: ModuleId,
        /// Failure description.
        message: String,
    },
    /// A packet handler failed and its packet was dropped.
    HandlerFault {
        /// Session id.
        session_id: SessionId,
        /// Direction of the dropped packet.
        direction: Direction,
        /// Name of the dropped packet.
        packet: String,
        /// The fault.
        fault: HandlerFault,
    },
    /// The client connection reported an error.
    ClientError {
        /// Session id.
        session_id: SessionId,
        /// Error description.
        message: String,
    },
    /// The target connection reported an error.
    TargetError {
        /// Session id.
        session_id: SessionId,
        /// Error description.
        message: String,
    },
    /// The worker exited abnormally.
    WorkerError {
        /// Session id.
        session_id: SessionId,
        /// Exit description.
        message: String,
    },
    /// The session finished tearing down.
    Closed {
        /// Session id.
        session_id: SessionId,
        /// First teardown trigger.
        reason: TeardownReason,
    },
}

impl SessionEvent {
    /// Returns the session this event belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::WorkerOnline { session_id, .. }
            | Self::PluginsLoaded { session_id, .. }
            | Self::PluginError { session_id, .. }
            | Self::HandlerFault { session_id, .. }
            | Self::ClientError { session_id, .. }
            | Self::TargetError { session_id, .. }
            | Self::WorkerError { session_id, .. }
            | Self::Closed { session_id, .. } => *session_id,
        }
    }

    /// Returns `true` for error events.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::PluginError { .. }
                | Self::HandlerFault { .. }
                | Self::ClientError { .. }
                | Self::TargetError { .. }
                | Self::WorkerError { .. }
        )
    }
}
