//! Modular Proxy - Intercepting proxy with pluggable packet handlers.
//!
//! This library sits between a game client and a target server, relays
//! decoded protocol packets in both directions and lets plugins inspect,
//! rewrite, drop and inject packets.
//!
//! # Architecture
//!
//! The proxy runs one session per logged-in client:
//!
//! - **Orchestrator**: owns the client and target connections, pumps their
//!   packets into the pipeline and hosts secondary plugin entries
//! - **Worker**: an isolated thread with its own runtime, running the
//!   interception pipeline and primary plugin entries
//!
//! Key design principles:
//!
//! - Each [`Session`] owns: client connection + target connection + worker
//! - Orchestrator and worker talk only through named [`Channel`]s
//! - Packets of one direction are dispatched strictly in arrival order
//! - A failing handler drops its packet and never stops the session
//!
//! # Quick Start
//!
//! ```no_run
//! use modular_proxy::{
//!     LoadHooks, PluginLoader, PluginRegistry, ProxyServer, Result, Settings, discover_modules,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::builder()
//!         .target("mc.example.net", 25565)
//!         .listen_port(25566)
//!         .build()?;
//!
//!     let mut registry = PluginRegistry::new();
//!     modular_proxy::plugins::register_bundled(&mut registry);
//!
//!     let modules = discover_modules(&settings.modules_dir, &settings.layout)?;
//!     let loader = PluginLoader::new(registry, modules, LoadHooks::logging());
//!
//!     let server = ProxyServer::bind(&settings, loader).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | [`Settings`] from the environment or [`ProxyBuilder`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`pipeline`] | Interception pipeline: [`Proxy`], [`EventBus`] |
//! | [`plugin`] | Plugin contract, discovery and loading |
//! | [`plugins`] | Bundled plugins |
//! | [`protocol`] | Packet and envelope types |
//! | [`server`] | Listener: [`ProxyServer`] |
//! | [`session`] | Session orchestration: [`Session`], worker, teardown |
//! | [`transport`] | Channels, peer connections, login handshake |

// ============================================================================
// Modules
// ============================================================================

/// Proxy configuration.
///
/// Use [`Settings::from_env()`] or [`Settings::builder()`].
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for proxy entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Interception pipeline.
///
/// - [`Proxy`] - Per-session pipeline with one side per direction
/// - [`EventBus`] - Ordered handler chain of one direction
pub mod pipeline;

/// Plugin contract, discovery and loading.
pub mod plugin;

/// Bundled plugins.
pub mod plugins;

/// Protocol message types.
pub mod protocol;

/// Proxy listener.
pub mod server;

/// Session orchestration.
pub mod session;

/// Transport layer.
///
/// Named channels between orchestrator and worker, peer connections and
/// the login handshake.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{AuthMode, ProxyBuilder, ServerOptions, Settings, TargetOptions};

// Error types
pub use error::{BoxError, Error, HandlerResult, PluginResult, Result};

// Identifier types
pub use identifiers::{ModuleId, SessionId};

// Pipeline types
pub use pipeline::{
    ConnectionSide, DispatchOutcome, EventBus, HandlerFault, HandlerScope, PipelineStats, Proxy,
};

// Plugin types
pub use plugin::{
    LoadContext, LoadHooks, LoadReport, ModuleLayout, ModuleSet, Plugin, PluginLoader,
    PluginModule, PluginRegistry, discover_modules,
};

// Protocol types
pub use protocol::{Direction, Packet, ProtocolState, RawPacket};

// Server
pub use server::ProxyServer;

// Session types
pub use session::{Session, SessionEvent, SessionState, TeardownReason, WorkerExit, WorkerScope};

// Transport types
pub use transport::{Channel, PeerConnection, PeerEvent};
