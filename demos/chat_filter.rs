//! Chat filter demonstration.
//!
//! Demonstrates:
//! - A primary entry that rewrites and cancels upstream chat packets
//! - Injecting a packet back to the client
//! - A secondary entry talking to the primary over a named channel
//! - Session events and teardown
//!
//! Runs entirely in memory; no target server is needed.
//!
//! Usage:
//!   cargo run --example chat_filter
//!   cargo run --example chat_filter -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::json;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use modular_proxy::{
    Channel, LoadHooks, ModuleSet, PeerConnection, Plugin, PluginLoader, PluginModule,
    PluginRegistry, PluginResult, ProtocolState, RawPacket, Result, Session, SessionEvent,
    WorkerScope,
};

// ============================================================================
// Constants
// ============================================================================

const BLOCKED_WORDS: &[&str] = &["password", "token"];
const STATS_CHANNEL: &str = "chat-filter.stats";

// ============================================================================
// Plugin
// ============================================================================

/// Masks blocked words and answers `!help` locally.
#[derive(Default)]
struct ChatFilter;

#[async_trait]
impl Plugin for ChatFilter {
    async fn activate(&self, scope: &WorkerScope) -> PluginResult {
        let stats: Channel<u64, String> = scope.create_channel(STATS_CHANNEL)?;
        let masked = Arc::new(AtomicU64::new(0));

        {
            let masked = Arc::clone(&masked);
            let reply = stats.clone();
            stats.subscribe(move |_request: String| {
                let _ = reply.write(masked.load(Ordering::Relaxed));
            });
        }

        let proxy = Arc::clone(scope.proxy());
        scope.proxy().upstream().on("chat", move |packet| {
            let proxy = Arc::clone(&proxy);
            let masked = Arc::clone(&masked);
            async move {
                let Some(message) = packet.get("message").and_then(|m| m.as_str()) else {
                    return Ok(());
                };

                if message == "!help" {
                    packet.cancel();
                    proxy.write_downstream(
                        "chat",
                        json!({ "message": "Blocked words are masked before they leave." }),
                    )?;
                    return Ok(());
                }

                let mut filtered = message.to_string();
                for word in BLOCKED_WORDS {
                    filtered = filtered.replace(word, &"*".repeat(word.len()));
                }
                if filtered != message {
                    masked.fetch_add(1, Ordering::Relaxed);
                    packet.set("message", filtered);
                }
                Ok(())
            }
            .boxed()
        });

        Ok(())
    }

    async fn activate_local(&self, session: &Session) -> PluginResult {
        let stats: Channel<String, u64> = session.create_channel(STATS_CHANNEL)?;
        stats.subscribe(|count| println!("        [stats] masked so far: {count}"));

        let mut events = session.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let SessionEvent::Closed { reason, .. } = event {
                    println!("        [event] session closed: {reason}");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = stats.write("count".to_string());
        });

        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    let filter = if debug {
        "modular_proxy=debug"
    } else {
        "modular_proxy=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    println!("=== Chat Filter ===\n");

    // ========================================================================
    // Setup
    // ========================================================================

    let mut registry = PluginRegistry::new();
    registry.register_default::<ChatFilter>("chat-filter");

    let modules = ModuleSet::from_modules(vec![
        PluginModule::new("chat-filter")
            .with_primary()
            .with_secondary(),
    ]);
    let loader = PluginLoader::new(registry, modules, LoadHooks::logging());

    let (client, client_side) = PeerConnection::pair();
    let (target_side, target) = PeerConnection::pair();

    let session = Session::start("Steve", client_side, target_side, loader).await?;
    println!(
        "[Setup] Session {} running (worker online in {:?})\n",
        session.id(),
        session.worker_startup()
    );

    // ========================================================================
    // Traffic
    // ========================================================================

    for message in ["hello", "my password is hunter2", "!help"] {
        println!("[Client] → {message}");
        client.send(RawPacket::new(
            "chat",
            json!({ "message": message }),
            Some(ProtocolState::Play),
        ))?;
    }

    for _ in 0..2 {
        let packet = timeout(Duration::from_secs(2), target.next_packet())
            .await
            .map_err(|_| modular_proxy::Error::connection_timeout(2000))??;
        println!("[Target] ← {}", packet.data["message"]);
    }

    let reply = timeout(Duration::from_secs(2), client.next_packet())
        .await
        .map_err(|_| modular_proxy::Error::connection_timeout(2000))??;
    println!("[Client] ← {}", reply.data["message"]);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // ========================================================================
    // Teardown
    // ========================================================================

    println!("\n[Teardown] Client disconnects...");
    drop(client);
    session.closed().await;
    println!("[Teardown] Reason: {:?}", session.close_reason());

    println!("\n=== Done ===");
    Ok(())
}
