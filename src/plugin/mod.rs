//! Plugin modules and their activation.
//!
//! Plugins are linked into the binary and registered by identity in a
//! [`PluginRegistry`]. Which plugins a session activates, and in what order,
//! comes from a [`ModuleSet`], either discovered from a modules directory or
//! listed explicitly.
//!
//! # Load Sequence
//!
//! ```text
//! Session::start
//!   ├─ worker:        PluginLoader::load_primary(&WorkerScope)
//!   │                   handlers registered on the pipeline
//!   └─ orchestrator:  PluginLoader::load_secondary(&Session)
//!                       channels created on the session
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `api` | The [`Plugin`] trait |
//! | `discovery` | Module directories, entries and manifests |
//! | `loader` | Sequential activation with hooks |
//! | `registry` | Identity to factory map |

// ============================================================================
// Submodules
// ============================================================================

/// Plugin entry contract.
pub mod api;

/// Module discovery and manifests.
pub mod discovery;

/// Sequential activation.
pub mod loader;

/// Plugin registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use api::Plugin;
pub use discovery::{
    ConditionalEntry, GlobalManifest, LocalManifest, ModuleLayout, ModuleSet, PluginModule,
    discover_modules,
};
pub use loader::{LoadContext, LoadHooks, LoadReport, PluginLoader, conditional_id};
pub use registry::{PluginFactory, PluginRegistry};
