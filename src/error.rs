//! Error types for the modular proxy.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use modular_proxy::{Error, Result};
//!
//! async fn example(session: &Session) -> Result<()> {
//!     let channel = session.create_channel::<String, String>("chat.relay")?;
//!     channel.write("hello".to_string())?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Plugins | [`Error::PluginContract`], [`Error::PluginActivation`] |
//! | Channels | [`Error::ChannelExists`], [`Error::ChannelClosed`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Protocol`] |
//! | Worker | [`Error::Worker`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] |
//!
//! Handler failures inside the interception pipeline are not surfaced as
//! [`Error`]; handlers return [`HandlerResult`] and a failure cancels the
//! packet being dispatched.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::error::Error as StdError;
use std::io::Error as IoError;
use std::result::Result as StdResult;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::ModuleId;

// ============================================================================
// Result Aliases
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

/// Boxed error returned by plugin code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result returned by packet handlers.
pub type HandlerResult = StdResult<(), BoxError>;

/// Result returned by plugin activation functions.
pub type PluginResult = StdResult<(), BoxError>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when proxy settings are missing or invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Plugin Errors
    // ========================================================================
    /// A module does not satisfy the plugin entry contract.
    ///
    /// Returned when a discovered module has no registered implementation,
    /// or its manifest cannot be read.
    #[error("Plugin contract violation in {module}: {message}")]
    PluginContract {
        /// Offending module.
        module: ModuleId,
        /// Description of the violation.
        message: String,
    },

    /// A plugin's activation function failed.
    #[error("Plugin {module} failed to activate: {message}")]
    PluginActivation {
        /// Module whose activation failed.
        module: ModuleId,
        /// Failure reported by the plugin.
        message: String,
    },

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// A channel with this id already exists in the session.
    #[error("Channel already exists: {id}")]
    ChannelExists {
        /// The duplicated channel id.
        id: String,
    },

    /// The link behind a channel is closed.
    #[error("Channel closed")]
    ChannelClosed,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Peer connection failed.
    ///
    /// Returned when the client or target connection cannot be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection timeout.
    ///
    /// Returned when a peer does not complete its handshake in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Peer connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Worker Errors
    // ========================================================================
    /// The session worker failed to start or crashed.
    #[error("Worker error: {message}")]
    Worker {
        /// Description of the worker failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Invalid URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a plugin contract violation.
    #[inline]
    pub fn plugin_contract(module: impl Into<ModuleId>, message: impl Into<String>) -> Self {
        Self::PluginContract {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Creates a plugin activation error.
    #[inline]
    pub fn plugin_activation(module: impl Into<ModuleId>, message: impl Into<String>) -> Self {
        Self::PluginActivation {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Creates a duplicate channel error.
    #[inline]
    pub fn channel_exists(id: impl Into<String>) -> Self {
        Self::ChannelExists { id: id.into() }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a connection timeout error for a wait that elapsed.
    ///
    /// Waits beyond `u64::MAX` milliseconds saturate.
    #[inline]
    pub fn timed_out(wait: Duration) -> Self {
        Self::connection_timeout(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX))
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a worker error.
    #[inline]
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error came from a plugin.
    #[inline]
    #[must_use]
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            Self::PluginContract { .. } | Self::PluginActivation { .. }
        )
    }

    /// Returns the module this error is attributed to, if any.
    #[must_use]
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            Self::PluginContract { module, .. } | Self::PluginActivation { module, .. } => {
                Some(module)
            }
            _ => None,
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
