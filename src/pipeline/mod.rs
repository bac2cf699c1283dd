//! Packet interception pipeline.
//!
//! The pipeline runs inside the session worker. Every packet crossing the
//! proxy is dispatched to the handlers of its direction before being relayed.
//!
//! # Packet Lifecycle
//!
//! ```text
//! pending ──► handlers ──┬──► forwarded   (written to internal.proxy)
//!                        ├──► canceled    (dropped)
//!                        └──► faulted     (dropped, fault reported)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bus` | Handler registry and chain execution |
//! | `proxy` | Per-direction dispatch, injection and statistics |

// ============================================================================
// Submodules
// ============================================================================

/// Handler registry and chain execution.
pub mod bus;

/// Per-session interception pipeline.
pub mod proxy;

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{EventBus, HandlerFault, HandlerScope, PacketHandler};
pub use proxy::{
    ConnectionSide, DirectionStats, DispatchOutcome, FaultObserver, PipelineChannel,
    PipelineStats, Proxy,
};
