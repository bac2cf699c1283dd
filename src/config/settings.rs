//! Proxy settings.
//!
//! Settings come from environment variables (a `.env` file is honored by the
//! binary):
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `VERSION` | `1.19.4` | Protocol version announced to both sides |
//! | `TARGET_HOST` | required | Target server host |
//! | `TARGET_PORT` | `25565` | Target server port |
//! | `TARGET_USERNAME` | client's | Username used to log into the target |
//! | `TARGET_AUTH` | `offline` | `offline`, `microsoft` or `mojang` |
//! | `SERVER_HOST` | `127.0.0.1` | Listen address |
//! | `SERVER_PORT` | `25565` | Listen port |
//! | `SERVER_MOTD` | `host:port` of the target | Server list message |
//! | `MODULES_DIR` | `modules` | Plugin modules root |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::plugin::ModuleLayout;

// ============================================================================
// Constants
// ============================================================================

/// Default protocol version.
pub const DEFAULT_VERSION: &str = "1.19.4";

/// Default game port, for both the listener and the target.
pub const DEFAULT_PORT: u16 = 25565;

/// Default listen address.
pub const DEFAULT_SERVER_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default modules root.
pub const DEFAULT_MODULES_DIR: &str = "modules";

// ============================================================================
// AuthMode
// ============================================================================

/// How the proxy authenticates against the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication.
    #[default]
    Offline,
    /// Microsoft account.
    Microsoft,
    /// Legacy Mojang account.
    Mojang,
}

impl AuthMode {
    /// Returns the setting value.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Microsoft => "microsoft",
            Self::Mojang => "mojang",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            "microsoft" => Ok(Self::Microsoft),
            "mojang" => Ok(Self::Mojang),
            other => Err(Error::config(format!(
                "TARGET_AUTH must be offline, microsoft or mojang, got {other:?}"
            ))),
        }
    }
}

// ============================================================================
// TargetOptions
// ============================================================================

/// Where and how to connect to the target server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOptions {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Fixed username for the target; the client's when `None`.
    pub username: Option<String>,
    /// Authentication mode.
    pub auth: AuthMode,
    /// Protocol version.
    pub version: String,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: None,
            auth: AuthMode::Offline,
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl TargetOptions {
    /// Returns the WebSocket URL of the target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the host is not a valid URL host.
    pub fn ws_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("ws://{}:{}/", self.host, self.port))?)
    }

    /// Returns the username to log into the target with.
    #[must_use]
    pub fn username_for<'a>(&'a self, client_username: &'a str) -> &'a str {
        self.username.as_deref().unwrap_or(client_username)
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// ServerOptions
// ============================================================================

/// The proxy's own listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Listen address.
    pub host: IpAddr,
    /// Listen port (0 for random).
    pub port: u16,
    /// Server list message.
    pub motd: String,
    /// Protocol version.
    pub version: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST,
            port: DEFAULT_PORT,
            motd: String::new(),
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl ServerOptions {
    /// Returns the listen socket address.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener options.
    pub server: ServerOptions,
    /// Target options.
    pub target: TargetOptions,
    /// Plugin modules root.
    pub modules_dir: PathBuf,
    /// Entry file names.
    pub layout: ModuleLayout,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            target: TargetOptions::default(),
            modules_dir: PathBuf::from(DEFAULT_MODULES_DIR),
            layout: ModuleLayout::default(),
        }
    }
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is missing or invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through a variable lookup function.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let version = get("VERSION").unwrap_or_else(|| DEFAULT_VERSION.to_string());

        let target = TargetOptions {
            host: get("TARGET_HOST").ok_or_else(|| Error::config("TARGET_HOST is not set"))?,
            port: parse_or("TARGET_PORT", get("TARGET_PORT"), DEFAULT_PORT)?,
            username: get("TARGET_USERNAME"),
            auth: get("TARGET_AUTH")
                .map(|value| value.parse())
                .transpose()?
                .unwrap_or_default(),
            version: version.clone(),
        };

        let server = ServerOptions {
            host: parse_or("SERVER_HOST", get("SERVER_HOST"), DEFAULT_SERVER_HOST)?,
            port: parse_or("SERVER_PORT", get("SERVER_PORT"), DEFAULT_PORT)?,
            motd: get("SERVER_MOTD").unwrap_or_else(|| target.address()),
            version,
        };

        let modules_dir =
            PathBuf::from(get("MODULES_DIR").unwrap_or_else(|| DEFAULT_MODULES_DIR.to_string()));

        Ok(Self {
            server,
            target,
            modules_dir,
            layout: ModuleLayout::default(),
        })
    }
}

/// Parses an optional variable, falling back to `default`.
fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use rustc_hash::FxHashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[("TARGET_HOST", "mc.example.net")])).unwrap();

        assert_eq!(settings.target.host, "mc.example.net");
        assert_eq!(settings.target.port, 25565);
        assert_eq!(settings.target.version, "1.19.4");
        assert_eq!(settings.target.auth, AuthMode::Offline);
        assert_eq!(settings.target.username, None);
        assert_eq!(settings.server.socket_addr().to_string(), "127.0.0.1:25565");
        assert_eq!(settings.server.motd, "mc.example.net:25565");
        assert_eq!(settings.modules_dir, PathBuf::from("modules"));
    }

    #[test]
    fn test_all_variables() {
        let settings = Settings::from_lookup(lookup(&[
            ("VERSION", "1.20.1"),
            ("TARGET_HOST", "10.0.0.5"),
            ("TARGET_PORT", "25570"),
            ("TARGET_USERNAME", "ProxyBot"),
            ("TARGET_AUTH", "Microsoft"),
            ("SERVER_HOST", "0.0.0.0"),
            ("SERVER_PORT", "30000"),
            ("SERVER_MOTD", "Welcome"),
            ("MODULES_DIR", "/opt/modules"),
        ]))
        .unwrap();

        assert_eq!(settings.target.port, 25570);
        assert_eq!(settings.target.username.as_deref(), Some("ProxyBot"));
        assert_eq!(settings.target.auth, AuthMode::Microsoft);
        assert_eq!(settings.server.version, "1.20.1");
        assert_eq!(settings.server.socket_addr().to_string(), "0.0.0.0:30000");
        assert_eq!(settings.server.motd, "Welcome");
        assert_eq!(settings.modules_dir, PathBuf::from("/opt/modules"));
    }

    #[test]
    fn test_missing_target_host() {
        let err = Settings::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_invalid_port() {
        let err = Settings::from_lookup(lookup(&[
            ("TARGET_HOST", "a"),
            ("TARGET_PORT", "seventy"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("TARGET_PORT"));
    }

    #[test]
    fn test_invalid_auth() {
        let err =
            Settings::from_lookup(lookup(&[("TARGET_HOST", "a"), ("TARGET_AUTH", "ldap")]))
                .unwrap_err();
        assert!(err.to_string().contains("TARGET_AUTH"));
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings =
            Settings::from_lookup(lookup(&[("TARGET_HOST", "a"), ("TARGET_USERNAME", "")]))
                .unwrap();
        assert_eq!(settings.target.username, None);
    }

    #[test]
    fn test_target_url_and_username() {
        let target = TargetOptions {
            host: "mc.example.net".into(),
            port: 25570,
            username: Some("Bot".into()),
            ..TargetOptions::default()
        };
        assert_eq!(target.ws_url().unwrap().as_str(), "ws://mc.example.net:25570/");
        assert_eq!(target.username_for("Steve"), "Bot");

        let anonymous = TargetOptions::default();
        assert_eq!(anonymous.username_for("Steve"), "Steve");
    }
}
