//! Transport layer.
//!
//! Two kinds of links carry traffic through the proxy:
//!
//! ```text
//! ┌────────┐  PeerConnection  ┌──────────────┐   Link    ┌──────────┐  PeerConnection  ┌────────┐
//! │ Client │◄────────────────►│ Orchestrator │◄─────────►│  Worker  │                  │ Target │
//! └────────┘    WebSocket     │  ChannelHub  │  channels │ChannelHub│                  └────────┘
//!                             └──────┬───────┘           └──────────┘                      ▲
//!                                    └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Named channels between orchestrator and worker |
//! | `peer` | Client and target connections and their event loops |
//! | `login` | Login and status handshakes |

// ============================================================================
// Submodules
// ============================================================================

/// Named, multiplexed channels over a link.
pub mod channel;

/// Login handshake helpers.
pub mod login;

/// Client and target connections.
pub mod peer;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Channel, ChannelHub, Link, link};
pub use login::{
    ClientHello, LOGIN_TIMEOUT, accept_client, connect_target, disconnect, login_success,
    login_target, status_response,
};
pub use peer::{PeerConnection, PeerEvent};
