//! Proxy configuration.
//!
//! Settings are read from the environment with [`Settings::from_env`] or
//! assembled in code with [`ProxyBuilder`].
//!
//! # Example
//!
//! ```no_run
//! use modular_proxy::Settings;
//!
//! # fn example() -> modular_proxy::Result<()> {
//! let settings = Settings::from_env()?;
//! println!("proxying to {}", settings.target.address());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent settings builder.
pub mod builder;

/// Settings types and environment loading.
pub mod settings;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ProxyBuilder;
pub use settings::{AuthMode, ServerOptions, Settings, TargetOptions};
