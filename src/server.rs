//! Proxy listener.
//!
//! Accepts client connections on one port and runs one [`Session`] per
//! login.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              ProxyServer                │
//! │            (single port)                │
//! │  ┌─────────────────────────────────┐    │
//! │  │ SessionId=1 → Session (Steve)   │    │
//! │  │ SessionId=2 → Session (Alex)    │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Connection Flow
//!
//! 1. TCP accept, WebSocket upgrade
//! 2. First client packet: server list ping or login
//! 3. Ping: answer with the MOTD and close
//! 4. Login: connect and log into the target, confirm to the client,
//!    start the session
//! 5. The session leaves the registry when it closes

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ServerOptions, Settings, TargetOptions};
use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::plugin::PluginLoader;
use crate::session::Session;
use crate::transport::{
    ClientHello, LOGIN_TIMEOUT, PeerConnection, accept_client, connect_target, disconnect,
    status_response,
};

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval, bounding how long shutdown takes to be noticed.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// ProxyServer
// ============================================================================

/// Accepts clients and owns their sessions.
///
/// # Example
///
/// ```ignore
/// let settings = Settings::from_env()?;
/// let loader = PluginLoader::new(registry, modules, LoadHooks::logging());
///
/// let server = ProxyServer::bind(&settings, loader).await?;
/// tokio::signal::ctrl_c().await?;
/// server.shutdown().await;
/// ```
pub struct ProxyServer {
    /// Bound address.
    local_addr: SocketAddr,

    /// Listener options (MOTD, version).
    options: ServerOptions,

    /// Target to proxy to.
    target: TargetOptions,

    /// Plugin loader shared by all sessions.
    loader: PluginLoader,

    /// Live sessions by id.
    sessions: RwLock<FxHashMap<SessionId, Session>>,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

// ============================================================================
// ProxyServer - Constructor
// ============================================================================

impl ProxyServer {
    /// Binds the listener and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(settings: &Settings, loader: PluginLoader) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(settings.server.socket_addr()).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            options: settings.server.clone(),
            target: settings.target.clone(),
            loader,
            sessions: RwLock::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let accept = Arc::clone(&server);
        tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });

        info!(
            %local_addr,
            target = %settings.target.address(),
            modules = server.loader.modules().len(),
            "Proxy listening"
        );

        Ok(server)
    }
}

// ============================================================================
// ProxyServer - Public API
// ============================================================================

impl ProxyServer {
    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL clients connect to.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns a live session by id.
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Returns all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Returns `true` once shutdown has been requested.
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every session.
    pub async fn shutdown(&self) {
        info!("Proxy shutting down");

        self.shutdown.store(true, Ordering::SeqCst);

        let sessions: Vec<_> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };

        for session in sessions {
            session.close().await;
            debug!(session_id = %session.id(), "Session closed during shutdown");
        }

        info!("Proxy shutdown complete");
    }
}

// ============================================================================
// ProxyServer - Accept Loop
// ============================================================================

impl ProxyServer {
    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.is_shutting_down() {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, %addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Handles a single incoming connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(%addr, "New TCP connection");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;
        let client = PeerConnection::from_websocket(ws_stream);

        let username = match accept_client(&client, LOGIN_TIMEOUT).await? {
            ClientHello::Status => {
                debug!(%addr, "Server list ping");
                client.send(status_response(&self.options.motd, &self.options.version))?;
                client.shutdown();
                return Ok(());
            }
            ClientHello::Login { username } => username,
        };

        info!(%addr, %username, "Client login");

        let target = match connect_target(&self.target, &username).await {
            Ok(target) => target,
            Err(e) => {
                let _ = client.send(disconnect(&e.to_string()));
                client.shutdown();
                return Err(e);
            }
        };

        // Answers the login with `login_success` or `disconnect`.
        let session = Session::start_login(username, client, target, self.loader.clone()).await?;
        let session_id = session.id();

        if self.is_shutting_down() {
            session.close().await;
            return Ok(());
        }

        self.sessions.write().insert(session_id, session.clone());

        // Leave the registry once closed.
        let server = Arc::clone(&self);
        tokio::spawn(async move {
            session.closed().await;
            server.sessions.write().remove(&session_id);
            debug!(%session_id, reason = ?session.close_reason(), "Session removed");
        });

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use serde_json::json;
    use tokio_tungstenite::accept_async;
    use url::Url;

    use async_trait::async_trait;

    use crate::error::PluginResult;
    use crate::plugin::{LoadHooks, ModuleSet, Plugin, PluginModule, PluginRegistry};
    use crate::protocol::{ProtocolState, RawPacket};
    use crate::session::WorkerScope;
    use crate::transport::login_success;
    use crate::transport::login::{LOGIN_START, LOGIN_SUCCESS, STATUS_REQUEST, STATUS_RESPONSE};

    /// Fake target: accepts one login, then echoes chat packets.
    async fn fake_target(accept: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let peer = PeerConnection::from_websocket(accept_async(stream).await.unwrap());

            let start = peer.next_packet().await.unwrap();
            assert_eq!(start.name, LOGIN_START);
            if !accept {
                peer.send(disconnect("server full")).unwrap();
                let _ = peer.next_event().await;
                return;
            }
            peer.send(login_success(start.data["username"].as_str().unwrap()))
                .unwrap();

            while let Ok(packet) = peer.next_packet().await {
                let message = packet.data["message"].as_str().unwrap_or_default();
                let _ = peer.send(RawPacket::new(
                    "chat",
                    json!({ "message": format!("echo:{message}") }),
                    Some(ProtocolState::Play),
                ));
            }
        });

        addr
    }

    fn settings(target: SocketAddr) -> Settings {
        Settings {
            server: ServerOptions {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                motd: "A proxied server".into(),
                ..ServerOptions::default()
            },
            target: TargetOptions {
                host: target.ip().to_string(),
                port: target.port(),
                ..TargetOptions::default()
            },
            ..Settings::default()
        }
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(
            PluginRegistry::new(),
            ModuleSet::from_modules(Vec::new()),
            LoadHooks::logging(),
        )
    }

    /// Primary entry that always fails to activate.
    #[derive(Default)]
    struct Broken;

    #[async_trait]
    impl Plugin for Broken {
        async fn activate(&self, _scope: &WorkerScope) -> PluginResult {
            Err("cannot start".into())
        }
    }

    fn broken_loader() -> PluginLoader {
        let mut registry = PluginRegistry::new();
        registry.register_default::<Broken>("broken");
        PluginLoader::new(
            registry,
            ModuleSet::from_modules(vec![PluginModule::new("broken").with_primary()]),
            LoadHooks::new(),
        )
    }

    async fn connect(server: &ProxyServer) -> PeerConnection {
        let url = Url::parse(&server.ws_url()).unwrap();
        PeerConnection::connect(&url, Duration::from_secs(2))
            .await
            .unwrap()
    }

    async fn next_packet(peer: &PeerConnection) -> RawPacket {
        timeout(Duration::from_secs(5), peer.next_packet())
            .await
            .expect("timed out")
            .unwrap()
    }

    async fn wait_for_sessions(server: &ProxyServer, count: usize) {
        timeout(Duration::from_secs(5), async {
            while server.session_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count not reached");
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        let server = ProxyServer::bind(&settings("127.0.0.1:1".parse().unwrap()), loader())
            .await
            .unwrap();

        assert!(server.local_addr().port() > 0);
        assert!(server.ws_url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.session_count(), 0);

        server.shutdown().await;
        assert!(server.is_shutting_down());
    }

    #[tokio::test]
    async fn test_status_ping() {
        let server = ProxyServer::bind(&settings("127.0.0.1:1".parse().unwrap()), loader())
            .await
            .unwrap();
        let client = connect(&server).await;

        client
            .send(RawPacket::new(
                STATUS_REQUEST,
                json!({}),
                Some(ProtocolState::Status),
            ))
            .unwrap();

        let info = next_packet(&client).await;
        assert_eq!(info.name, STATUS_RESPONSE);
        assert_eq!(info.data["description"]["text"], json!("A proxied server"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_and_relay() {
        let target = fake_target(true).await;
        let server = ProxyServer::bind(&settings(target), loader()).await.unwrap();
        let client = connect(&server).await;

        client
            .send(RawPacket::new(
                LOGIN_START,
                json!({ "username": "Steve" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();
        assert_eq!(next_packet(&client).await.name, LOGIN_SUCCESS);

        wait_for_sessions(&server, 1).await;
        assert_eq!(server.sessions()[0].username(), "Steve");

        client
            .send(RawPacket::new(
                "chat",
                json!({ "message": "hi" }),
                Some(ProtocolState::Play),
            ))
            .unwrap();
        assert_eq!(
            next_packet(&client).await.data["message"],
            json!("echo:hi")
        );

        client.shutdown();
        wait_for_sessions(&server, 0).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_login_reaches_client() {
        let target = fake_target(false).await;
        let server = ProxyServer::bind(&settings(target), loader()).await.unwrap();
        let client = connect(&server).await;

        client
            .send(RawPacket::new(
                LOGIN_START,
                json!({ "username": "Steve" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();

        let refused = next_packet(&client).await;
        assert_eq!(refused.name, "disconnect");
        assert!(refused.data["reason"]
            .as_str()
            .unwrap()
            .contains("server full"));
        assert_eq!(server.session_count(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_session_start_disconnects_client() {
        let target = fake_target(true).await;
        let server = ProxyServer::bind(&settings(target), broken_loader())
            .await
            .unwrap();
        let client = connect(&server).await;

        client
            .send(RawPacket::new(
                LOGIN_START,
                json!({ "username": "Steve" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();

        // No login_success comes first.
        let refused = next_packet(&client).await;
        assert_eq!(refused.name, "disconnect");
        assert!(refused.data["reason"]
            .as_str()
            .unwrap()
            .contains("cannot start"));
        assert_eq!(server.session_count(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let target = fake_target(true).await;
        let server = ProxyServer::bind(&settings(target), loader()).await.unwrap();
        let client = connect(&server).await;

        client
            .send(RawPacket::new(
                LOGIN_START,
                json!({ "username": "Steve" }),
                Some(ProtocolState::Login),
            ))
            .unwrap();
        assert_eq!(next_packet(&client).await.name, LOGIN_SUCCESS);
        wait_for_sessions(&server, 1).await;

        let session = server.sessions().remove(0);
        server.shutdown().await;

        assert_eq!(server.session_count(), 0);
        assert_eq!(
            session.close_reason(),
            Some(crate::session::TeardownReason::Shutdown)
        );
    }
}
