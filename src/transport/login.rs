//! Login handshake on peer connections.
//!
//! # Client
//!
//! The first packet from a client decides what it wants:
//!
//! | Packet | State | Meaning |
//! |--------|-------|---------|
//! | `login_start { username }` | `login` | join through the proxy |
//! | `ping_start` | `status` | server list ping, answered with `server_info` |
//!
//! # Target
//!
//! The proxy logs into the target with `login_start` and waits for
//! `login_success`. Other login-state packets are skipped; `disconnect`
//! aborts.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::config::{AuthMode, TargetOptions};
use crate::error::{Error, Result};
use crate::protocol::{ProtocolState, RawPacket};

use super::peer::PeerConnection;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for a login handshake (30s, like the WebSocket handshake).
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client login request.
pub const LOGIN_START: &str = "login_start";

/// Login accepted.
pub const LOGIN_SUCCESS: &str = "login_success";

/// Login refused.
pub const LOGIN_DISCONNECT: &str = "disconnect";

/// Server list ping request.
pub const STATUS_REQUEST: &str = "ping_start";

/// Server list ping response.
pub const STATUS_RESPONSE: &str = "server_info";

// ============================================================================
// ClientHello
// ============================================================================

/// What a newly connected client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// Join with this username.
    Login {
        /// Username sent by the client.
        username: String,
    },
    /// Server list ping.
    Status,
}

/// Waits for a client's first packet.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if nothing arrives within `wait`
/// - [`Error::Protocol`] if the packet is not a login or status request
/// - [`Error::ConnectionClosed`] if the client leaves first
pub async fn accept_client(client: &PeerConnection, wait: Duration) -> Result<ClientHello> {
    let packet = tokio::time::timeout(wait, client.next_packet())
        .await
        .map_err(|_| Error::timed_out(wait))??;

    match (packet.state, packet.name.as_str()) {
        (Some(ProtocolState::Login) | None, LOGIN_START) => {
            let username = packet
                .data
                .get("username")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| Error::protocol("login_start without username"))?;

            debug!(username, "Client login");
            Ok(ClientHello::Login {
                username: username.to_string(),
            })
        }
        (Some(ProtocolState::Status) | None, STATUS_REQUEST) => Ok(ClientHello::Status),
        (state, name) => Err(Error::protocol(format!(
            "unexpected first packet {name} (state {state:?})"
        ))),
    }
}

/// Logs into the target and waits for acceptance.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if the target does not answer within `wait`
/// - [`Error::Connection`] if the target refuses the login
/// - [`Error::ConnectionClosed`] if the target leaves first
pub async fn login_target(
    target: &PeerConnection,
    username: &str,
    options: &TargetOptions,
    wait: Duration,
) -> Result<()> {
    let mut data = json!({
        "username": username,
        "version": options.version,
    });
    if options.auth != AuthMode::Offline {
        data["auth"] = json!(options.auth.as_str());
    }

    target.send(RawPacket::new(LOGIN_START, data, Some(ProtocolState::Login)))?;

    let deadline = Instant::now() + wait;
    loop {
        let packet = timeout_at(deadline, target.next_packet())
            .await
            .map_err(|_| Error::timed_out(wait))??;

        match packet.name.as_str() {
            LOGIN_SUCCESS => {
                debug!(username, "Target accepted login");
                return Ok(());
            }
            LOGIN_DISCONNECT => {
                let reason = packet
                    .data
                    .get("reason")
                    .map_or_else(String::new, Value::to_string);
                return Err(Error::connection(format!("target refused login: {reason}")));
            }
            other => trace!(packet = other, "Skipping login packet"),
        }
    }
}

/// Connects to the target and logs in.
///
/// Uses the configured target username, or `client_username` when none is
/// set.
///
/// # Errors
///
/// - [`Error::Url`] if the target address is invalid
/// - Connection and login errors from [`PeerConnection::connect`] and
///   [`login_target`]
pub async fn connect_target(options: &TargetOptions, client_username: &str) -> Result<PeerConnection> {
    let url = options.ws_url()?;
    let target = PeerConnection::connect(&url, LOGIN_TIMEOUT).await?;

    login_target(
        &target,
        options.username_for(client_username),
        options,
        LOGIN_TIMEOUT,
    )
    .await?;

    Ok(target)
}

/// Builds the `login_success` packet sent to a client.
#[must_use]
pub fn login_success(username: &str) -> RawPacket {
    RawPacket::new(
        LOGIN_SUCCESS,
        json!({ "username": username }),
        Some(ProtocolState::Login),
    )
}

/// Builds the `disconnect` packet that refuses a client login.
#[must_use]
pub fn disconnect(reason: &str) -> RawPacket {
    RawPacket::new(
        LOGIN_DISCONNECT,
        json!({ "reason": reason }),
        Some(ProtocolState::Login),
    )
}

/// Builds the `server_info` packet answering a server list ping.
#[must_use]
pub fn status_response(motd: &str, version: &str) -> RawPacket {
    RawPacket::new(
        STATUS_RESPONSE,
        json!({
            "version": { "name": version },
            "description": { "text": motd },
        }),
        Some(ProtocolState::Status),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn target_options() -> TargetOptions {
        TargetOptions {
            host: "mc.example.net".into(),
            ..TargetOptions::default()
        }
    }

    #[tokio::test]
    async fn test_accept_login() {
        let (remote, local) = PeerConnection::pair();
        remote
            .send(RawPacket::new(
                LOGIN_START,
                json!({ "username": "Steve" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();

        let hello = accept_client(&local, LOGIN_TIMEOUT).await.unwrap();
        assert_eq!(
            hello,
            ClientHello::Login {
                username: "Steve".into()
            }
        );
    }

    #[tokio::test]
    async fn test_accept_status() {
        let (remote, local) = PeerConnection::pair();
        remote
            .send(RawPacket::new(
                STATUS_REQUEST,
                json!({}),
                Some(ProtocolState::Status),
            ))
            .unwrap();

        assert_eq!(
            accept_client(&local, LOGIN_TIMEOUT).await.unwrap(),
            ClientHello::Status
        );
    }

    #[tokio::test]
    async fn test_login_requires_username() {
        let (remote, local) = PeerConnection::pair();
        remote
            .send(RawPacket::new(LOGIN_START, json!({}), Some(ProtocolState::Login)))
            .unwrap();

        let err = accept_client(&local, LOGIN_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_first_packet() {
        let (remote, local) = PeerConnection::pair();
        remote
            .send(RawPacket::new("chat", json!({}), Some(ProtocolState::Play)))
            .unwrap();

        assert!(accept_client(&local, LOGIN_TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let (_remote, local) = PeerConnection::pair();
        let err = accept_client(&local, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn test_login_target_skips_until_success() {
        let (local, server) = PeerConnection::pair();

        let task = tokio::spawn(async move {
            let start = server.next_packet().await.unwrap();
            assert_eq!(start.name, LOGIN_START);
            assert_eq!(start.data["username"], json!("Alex"));
            assert!(start.data.get("auth").is_none());

            server
                .send(RawPacket::new("compress", json!({ "threshold": 256 }), None))
                .unwrap();
            server.send(login_success("Alex")).unwrap();
            server
        });

        login_target(&local, "Alex", &target_options(), LOGIN_TIMEOUT)
            .await
            .unwrap();
        let _server = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_target_refused() {
        let (local, server) = PeerConnection::pair();
        server
            .send(RawPacket::new(
                LOGIN_DISCONNECT,
                json!({ "reason": "whitelist" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();

        let err = login_target(&local, "Alex", &target_options(), LOGIN_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("whitelist"));
    }

    #[test]
    fn test_status_response_shape() {
        let packet = status_response("hello", "1.19.4");
        assert_eq!(packet.name, STATUS_RESPONSE);
        assert_eq!(packet.data["description"]["text"], json!("hello"));
    }
}
