//! Builder pattern for proxy configuration.
//!
//! Provides a fluent API for assembling [`Settings`] in code instead of the
//! environment.
//!
//! # Example
//!
//! ```
//! use modular_proxy::ProxyBuilder;
//!
//! # fn example() -> modular_proxy::Result<()> {
//! let settings = ProxyBuilder::new()
//!     .target("mc.example.net", 25565)
//!     .listen_port(25566)
//!     .modules_dir("./modules")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::plugin::ModuleLayout;

use super::settings::{AuthMode, ServerOptions, Settings, TargetOptions};

// ============================================================================
// ProxyBuilder
// ============================================================================

/// Builder for [`Settings`].
///
/// Use [`Settings::builder()`] or [`ProxyBuilder::new()`].
#[derive(Debug, Default, Clone)]
pub struct ProxyBuilder {
    /// Target host; required.
    target_host: Option<String>,
    /// Target port.
    target_port: Option<u16>,
    /// Fixed target username.
    target_username: Option<String>,
    /// Target authentication.
    auth: AuthMode,
    /// Protocol version.
    version: Option<String>,
    /// Listen address.
    listen_host: Option<IpAddr>,
    /// Listen port.
    listen_port: Option<u16>,
    /// Server list message.
    motd: Option<String>,
    /// Plugin modules root.
    modules_dir: Option<PathBuf>,
    /// Entry file names.
    layout: Option<ModuleLayout>,
}

// ============================================================================
// ProxyBuilder Implementation
// ============================================================================

impl ProxyBuilder {
    /// Creates a builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target server.
    #[inline]
    #[must_use]
    pub fn target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.target_host = Some(host.into());
        self.target_port = Some(port);
        self
    }

    /// Logs into the target with a fixed username instead of the client's.
    #[inline]
    #[must_use]
    pub fn target_username(mut self, username: impl Into<String>) -> Self {
        self.target_username = Some(username.into());
        self
    }

    /// Sets the target authentication mode.
    #[inline]
    #[must_use]
    pub fn auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the protocol version.
    #[inline]
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn listen_host(mut self, host: IpAddr) -> Self {
        self.listen_host = Some(host);
        self
    }

    /// Sets the listen port (0 for random).
    #[inline]
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Sets the server list message.
    #[inline]
    #[must_use]
    pub fn motd(mut self, motd: impl Into<String>) -> Self {
        self.motd = Some(motd.into());
        self
    }

    /// Sets the plugin modules root.
    #[inline]
    #[must_use]
    pub fn modules_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules_dir = Some(path.into());
        self
    }

    /// Sets the entry file names.
    #[inline]
    #[must_use]
    pub fn layout(mut self, layout: ModuleLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Builds the settings with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the target is not set
    /// - [`Error::Config`] if the target port is 0
    /// - [`Error::Config`] if the modules root exists but is not a directory
    pub fn build(self) -> Result<Settings> {
        let target = self.validate_target()?;
        let modules_dir = self.validate_modules_dir()?;

        let defaults = ServerOptions::default();
        let server = ServerOptions {
            host: self.listen_host.unwrap_or(defaults.host),
            port: self.listen_port.unwrap_or(defaults.port),
            motd: self.motd.clone().unwrap_or_else(|| target.address()),
            version: target.version.clone(),
        };

        Ok(Settings {
            server,
            target,
            modules_dir,
            layout: self.layout.unwrap_or_default(),
        })
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ProxyBuilder {
    /// Validates the target configuration.
    fn validate_target(&self) -> Result<TargetOptions> {
        let host = self.target_host.clone().ok_or_else(|| {
            Error::config(
                "Target host is required. Use .target() to set it.\n\
                 Example: ProxyBuilder::new().target(\"mc.example.net\", 25565)",
            )
        })?;

        let defaults = TargetOptions::default();
        let port = self.target_port.unwrap_or(defaults.port);
        if port == 0 {
            return Err(Error::config("Target port must not be 0"));
        }

        Ok(TargetOptions {
            host,
            port,
            username: self.target_username.clone(),
            auth: self.auth,
            version: self.version.clone().unwrap_or(defaults.version),
        })
    }

    /// Validates the modules root.
    ///
    /// A missing root is allowed and yields no modules.
    fn validate_modules_dir(&self) -> Result<PathBuf> {
        let path = self
            .modules_dir
            .clone()
            .unwrap_or_else(|| Settings::default().modules_dir);

        if path.exists() && !path.is_dir() {
            return Err(Error::config(format!(
                "Modules root is not a directory: {}",
                path.display()
            )));
        }

        Ok(path)
    }
}

impl Settings {
    /// Returns a builder for settings.
    #[inline]
    #[must_use]
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
