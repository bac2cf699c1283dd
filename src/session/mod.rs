//! Session orchestration.
//!
//! One [`Session`] per proxied client. Each session runs its interception
//! pipeline and primary plugin entries on an isolated worker thread and
//! relays packets between client and target.
//!
//! # Example
//!
//! ```ignore
//! use modular_proxy::{PeerConnection, Session};
//!
//! let session = Session::open(client, "Steve", &settings.target, loader).await?;
//!
//! let mut events = session.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Session orchestrator.
pub mod core;

/// Session events.
pub mod events;

/// Lifecycle state machine.
pub mod teardown;

/// Isolated worker.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::Session;
pub use events::SessionEvent;
pub use teardown::{SessionState, TeardownReason};
pub use worker::{WORKER_CHANNEL, WorkerExit, WorkerScope};
