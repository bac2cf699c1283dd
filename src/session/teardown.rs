//! Session lifecycle state machine.
//!
//! ```text
//!            trigger              cleanup done
//! Starting ───────────┐
//!    │                ├──► Closing ──────────► Closed
//!    ▼      trigger   │
//! Running ────────────┘
//! ```
//!
//! The first trigger wins and becomes the close reason. Triggers arriving
//! while `Closing` or `Closed` are ignored.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker spawned, plugins loading.
    Starting,
    /// Traffic flowing.
    Running,
    /// Teardown in progress.
    Closing,
    /// Everything released.
    Closed,
}

impl SessionState {
    /// Returns `true` once teardown has begun.
    #[inline]
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TeardownReason
// ============================================================================

/// What started a session's teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    /// The client connection ended.
    ClientClosed,
    /// The target connection ended.
    TargetClosed,
    /// The session worker exited or crashed.
    WorkerExited,
    /// The host asked the session to close.
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientClosed => "client closed",
            Self::TargetClosed => "target closed",
            Self::WorkerExited => "worker exited",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Thread-safe holder of a session's state.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<SessionState>,
    reason: Mutex<Option<TeardownReason>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            state,
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn reason(&self) -> Option<TeardownReason> {
        *self.reason.lock()
    }

    /// `Starting → Running`. Returns `false` from any other state.
    pub(crate) fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Running;
                true
            } else {
                false
            }
        })
    }

    /// `Starting | Running → Closing`.
    ///
    /// Returns `true` if this call won the transition; its reason is kept.
    pub(crate) fn begin_close(&self, reason: TeardownReason) -> bool {
        let won = self.state.send_if_modified(|state| {
            if state.is_terminating() {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });

        if won {
            *self.reason.lock() = Some(reason);
        }
        won
    }

    /// `Closing → Closed`.
    pub(crate) fn finish_close(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closing {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Waits until the state is `Closed`.
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_normal_lifecycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Starting);

        assert!(lifecycle.mark_running());
        assert_eq!(lifecycle.state(), SessionState::Running);

        assert!(lifecycle.begin_close(TeardownReason::ClientClosed));
        assert_eq!(lifecycle.state(), SessionState::Closing);

        lifecycle.finish_close();
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert_eq!(lifecycle.reason(), Some(TeardownReason::ClientClosed));
    }

    #[test]
    fn test_first_trigger_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_running();

        assert!(lifecycle.begin_close(TeardownReason::TargetClosed));
        assert!(!lifecycle.begin_close(TeardownReason::ClientClosed));
        assert!(!lifecycle.begin_close(TeardownReason::WorkerExited));

        assert_eq!(lifecycle.reason(), Some(TeardownReason::TargetClosed));
    }

    #[test]
    fn test_trigger_during_starting() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_close(TeardownReason::WorkerExited));
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.state(), SessionState::Closing);
    }

    #[test]
    fn test_triggers_ignored_after_closed() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_close(TeardownReason::Shutdown);
        lifecycle.finish_close();

        assert!(!lifecycle.begin_close(TeardownReason::ClientClosed));
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert_eq!(lifecycle.reason(), Some(TeardownReason::Shutdown));
    }

    #[test]
    fn test_finish_requires_closing() {
        let lifecycle = Lifecycle::new();
        lifecycle.finish_close();
        assert_eq!(lifecycle.state(), SessionState::Starting);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_finish() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_close(TeardownReason::Shutdown);

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.closed().await })
        };

        tokio::task::yield_now().await;
        lifecycle.finish_close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(TeardownReason::ClientClosed.to_string(), "client closed");
        assert_eq!(SessionState::Closing.to_string(), "closing");
    }
}
