//! Packet logger.
//!
//! The primary entry logs every packet in both directions at `debug` level
//! and counts them. The secondary entry logs dropped packets and the close
//! reason at `info`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::PluginResult;
use crate::identifiers::SessionId;
use crate::plugin::Plugin;
use crate::protocol::Direction;
use crate::session::{Session, SessionEvent, TeardownReason, WorkerScope};

// ============================================================================
// Constants
// ============================================================================

/// Module id of the packet logger.
pub const PACKET_LOG: &str = "packet-log";

// ============================================================================
// PacketLog
// ============================================================================

/// Logs packet traffic.
#[derive(Debug, Default)]
pub struct PacketLog {
    /// Packets seen by this instance's primary entry.
    seen: Arc<AtomicU64>,
}

impl PacketLog {
    /// Returns the number of packets seen.
    #[inline]
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for PacketLog {
    async fn activate(&self, scope: &WorkerScope) -> PluginResult {
        let session_id = scope.session_id();

        for direction in Direction::ALL {
            let seen = Arc::clone(&self.seen);
            scope.proxy().side(direction).on_packet(move |packet| {
                seen.fetch_add(1, Ordering::Relaxed);
                debug!(
                    %session_id,
                    %direction,
                    packet = %packet.name,
                    state = ?packet.state,
                    "Packet"
                );
                async { Ok(()) }.boxed()
            });
        }

        Ok(())
    }

    async fn activate_local(&self, session: &Session) -> PluginResult {
        let events = session.subscribe_events();
        let session_id = session.id();
        let username = session.username().to_string();

        tokio::spawn(log_events(session_id, username, events));

        Ok(())
    }
}

/// Logs dropped packets until the session closes.
///
/// Returns the close reason, or `None` if the event channel ended first.
async fn log_events(
    session_id: SessionId,
    username: String,
    mut events: broadcast::Receiver<SessionEvent>,
) -> Option<TeardownReason> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::HandlerFault {
                direction,
                packet,
                fault,
                ..
            }) => info!(%session_id, %direction, %packet, %fault, "Packet dropped"),
            Ok(SessionEvent::Closed { reason, .. }) => {
                info!(%session_id, %username, %reason, "Session closed");
                return Some(reason);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(%session_id, skipped, "Packet log fell behind session events");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::pipeline::{PipelineChannel, Proxy};
    use crate::plugin::{LoadHooks, ModuleSet, PluginLoader, PluginModule, PluginRegistry};
    use crate::protocol::{PROXY_CHANNEL, Packet};
    use crate::transport::{ChannelHub, PeerConnection, link};

    #[tokio::test]
    async fn test_counts_both_directions() {
        let (ours, _theirs) = link();
        let hub = ChannelHub::new(ours);
        let channel: PipelineChannel = hub.create_channel(PROXY_CHANNEL).unwrap();
        let proxy = Proxy::new(channel);
        let scope = WorkerScope::new(SessionId::next(), hub, Arc::clone(&proxy));

        let plugin = PacketLog::default();
        plugin.activate(&scope).await.unwrap();

        proxy
            .dispatch(Direction::Upstream, Packet::new("chat", json!({}), None))
            .await;
        proxy
            .dispatch(Direction::Downstream, Packet::new("tick", json!({}), None))
            .await;

        assert_eq!(plugin.seen(), 2);
    }

    #[tokio::test]
    async fn test_host_still_gets_startup_events() {
        let mut registry = PluginRegistry::new();
        crate::plugins::register_bundled(&mut registry);
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new(PACKET_LOG).with_primary().with_secondary(),
        ]);
        let loader = PluginLoader::new(registry, modules, LoadHooks::new());

        let (_client, client_side) = PeerConnection::pair();
        let (target_side, _target) = PeerConnection::pair();
        let session = Session::start("Steve", client_side, target_side, loader)
            .await
            .unwrap();

        let mut events = session.subscribe_events();
        let first = timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("no startup event")
            .unwrap();
        assert!(matches!(first, SessionEvent::WorkerOnline { .. }));

        session.close().await;
    }

    #[tokio::test]
    async fn test_event_log_survives_lag() {
        let session_id = SessionId::next();
        let (tx, rx) = broadcast::channel(2);
        let logger = tokio::spawn(log_events(session_id, "Steve".to_string(), rx));

        for _ in 0..4 {
            tx.send(SessionEvent::WorkerOnline {
                session_id,
                startup: Duration::ZERO,
            })
            .unwrap();
        }
        tx.send(SessionEvent::Closed {
            session_id,
            reason: TeardownReason::Shutdown,
        })
        .unwrap();

        let reason = timeout(Duration::from_secs(1), logger)
            .await
            .expect("logger did not finish")
            .unwrap();
        assert_eq!(reason, Some(TeardownReason::Shutdown));
    }
}
