//! Per-direction event bus.
//!
//! An [`EventBus`] holds the handlers of one direction: *generic* handlers
//! that see every packet, and *named* handlers keyed by packet name.
//!
//! Handlers form a chain of responsibility over one shared `&mut Packet`.
//! They run one at a time in registration order (generic first, then named),
//! so each handler observes the edits of the ones before it.
//!
//! # Example
//!
//! ```ignore
//! use futures_util::FutureExt;
//!
//! bus.on("chat", |packet| {
//!     async move {
//!         if packet.get("message").and_then(|m| m.as_str()) == Some("spam") {
//!             packet.cancel();
//!         }
//!         Ok(())
//!     }
//!     .boxed()
//! });
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{HandlerResult, panic_message};
use crate::protocol::Packet;

// ============================================================================
// Types
// ============================================================================

/// A registered packet handler.
///
/// Receives the packet under dispatch and may edit or cancel it.
/// Returning `Err` (or panicking) fails the dispatch closed.
pub type PacketHandler =
    Arc<dyn for<'a> Fn(&'a mut Packet) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

// ============================================================================
// HandlerFault
// ============================================================================

/// Which handler list a faulting handler belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerScope {
    /// Registered for every packet.
    Generic,
    /// Registered for one packet name.
    Named,
}

/// A handler failure recorded during dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFault {
    /// List the handler was registered in.
    pub scope: HandlerScope,
    /// Position of the handler within its list.
    pub index: usize,
    /// Error or panic message.
    pub message: String,
    /// `true` if the handler panicked rather than returning an error.
    pub panicked: bool,
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.panicked { "panicked" } else { "failed" };
        write!(
            f,
            "{:?} handler #{} {}: {}",
            self.scope, self.index, kind, self.message
        )
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Handler registry of one direction.
///
/// Append-only: handlers live as long as the bus.
#[derive(Default)]
pub struct EventBus {
    /// Handlers for every packet, in registration order.
    generic: RwLock<Vec<PacketHandler>>,
    /// Handlers by packet name, in registration order.
    named: RwLock<FxHashMap<String, Vec<PacketHandler>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("generic", &self.generic.read().len())
            .field("named", &self.handler_names())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every packet.
    pub fn on_packet<F>(&self, handler: F)
    where
        F: for<'a> Fn(&'a mut Packet) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.generic.write().push(Arc::new(handler));
    }

    /// Registers a handler for packets named `name`.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: for<'a> Fn(&'a mut Packet) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.named
            .write()
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Returns the number of generic handlers.
    #[inline]
    #[must_use]
    pub fn generic_count(&self) -> usize {
        self.generic.read().len()
    }

    /// Returns the number of handlers registered for `name`.
    #[inline]
    #[must_use]
    pub fn named_count(&self, name: &str) -> usize {
        self.named.read().get(name).map_or(0, Vec::len)
    }

    /// Returns the packet names that have handlers, sorted.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.named.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns `true` if no handler would see a packet named `name`.
    #[must_use]
    pub fn is_passthrough(&self, name: &str) -> bool {
        self.generic_count() == 0 && self.named_count(name) == 0
    }

    /// Runs the handler chain for one packet.
    ///
    /// Stops at the first failing handler and returns its fault.
    /// Cancellation does not stop the chain.
    pub async fn emit(&self, packet: &mut Packet) -> Result<(), HandlerFault> {
        let generic: Vec<PacketHandler> = self.generic.read().clone();
        Self::run_chain(HandlerScope::Generic, &generic, packet).await?;

        // Named handlers are selected after generic ones ran, by the
        // packet's name at that point.
        let named: Vec<PacketHandler> = self
            .named
            .read()
            .get(&packet.name)
            .cloned()
            .unwrap_or_default();
        Self::run_chain(HandlerScope::Named, &named, packet).await
    }

    /// Runs handlers sequentially over the shared packet.
    async fn run_chain(
        scope: HandlerScope,
        handlers: &[PacketHandler],
        packet: &mut Packet,
    ) -> Result<(), HandlerFault> {
        for (index, handler) in handlers.iter().enumerate() {
            let outcome = AssertUnwindSafe(async { handler(&mut *packet).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(HandlerFault {
                        scope,
                        index,
                        message: e.to_string(),
                        panicked: false,
                    });
                }
                Err(payload) => {
                    return Err(HandlerFault {
                        scope,
                        index,
                        message: panic_message(payload.as_ref()),
                        panicked: true,
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn chat(message: &str) -> Packet {
        Packet::new("chat", json!({ "message": message }), None)
    }

    #[tokio::test]
    async fn test_empty_bus_is_passthrough() {
        let bus = EventBus::new();
        let mut packet = chat("hi");

        assert!(bus.is_passthrough("chat"));
        assert!(bus.emit(&mut packet).await.is_ok());
        assert_eq!(packet, chat("hi"));
    }

    #[tokio::test]
    async fn test_generic_runs_before_named() {
        let bus = EventBus::new();
        bus.on("chat", |packet| {
            async move {
                let seen = packet.get("trail").and_then(|v| v.as_str()).unwrap_or("").to_string();
                packet.set("trail", format!("{seen}named"));
                Ok(())
            }
            .boxed()
        });
        bus.on_packet(|packet| {
            async move {
                packet.set("trail", "generic>");
                Ok(())
            }
            .boxed()
        });

        let mut packet = chat("hi");
        bus.emit(&mut packet).await.unwrap();
        assert_eq!(packet.get("trail"), Some(&json!("generic>named")));
    }

    #[tokio::test]
    async fn test_handlers_see_previous_edits() {
        let bus = EventBus::new();
        bus.on_packet(|packet| {
            async move {
                packet.set("tag", "A");
                Ok(())
            }
            .boxed()
        });
        bus.on_packet(|packet| {
            async move {
                let tag = packet.get("tag").and_then(|v| v.as_str()).unwrap_or("").to_string();
                packet.set("tag", format!("{tag}-B"));
                Ok(())
            }
            .boxed()
        });

        let mut packet = chat("x");
        bus.emit(&mut packet).await.unwrap();
        assert_eq!(packet.get("tag"), Some(&json!("A-B")));
    }

    #[tokio::test]
    async fn test_named_only_matches_name() {
        let bus = EventBus::new();
        bus.on("chat", |packet| {
            async move {
                packet.cancel();
                Ok(())
            }
            .boxed()
        });

        let mut other = Packet::new("keep_alive", json!({}), None);
        bus.emit(&mut other).await.unwrap();
        assert!(!other.is_canceled());

        let mut target = chat("x");
        bus.emit(&mut target).await.unwrap();
        assert!(target.is_canceled());
    }

    #[tokio::test]
    async fn test_cancel_does_not_stop_chain() {
        let bus = EventBus::new();
        bus.on_packet(|packet| {
            async move {
                packet.cancel();
                Ok(())
            }
            .boxed()
        });
        bus.on_packet(|packet| {
            async move {
                packet.set("after_cancel", true);
                Ok(())
            }
            .boxed()
        });

        let mut packet = chat("x");
        bus.emit(&mut packet).await.unwrap();
        assert!(packet.is_canceled());
        assert_eq!(packet.get("after_cancel"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_error_stops_chain() {
        let bus = EventBus::new();
        bus.on_packet(|_packet| async move { Err("bad payload".into()) }.boxed());
        bus.on_packet(|packet| {
            async move {
                packet.set("reached", true);
                Ok(())
            }
            .boxed()
        });

        let mut packet = chat("x");
        let fault = bus.emit(&mut packet).await.unwrap_err();

        assert_eq!(fault.scope, HandlerScope::Generic);
        assert_eq!(fault.index, 0);
        assert_eq!(fault.message, "bad payload");
        assert!(!fault.panicked);
        assert!(packet.get("reached").is_none());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let bus = EventBus::new();
        bus.on("chat", |packet| {
            async move {
                if packet.name == "chat" {
                    panic!("handler exploded");
                }
                Ok(())
            }
            .boxed()
        });

        let mut packet = chat("x");
        let fault = bus.emit(&mut packet).await.unwrap_err();

        assert_eq!(fault.scope, HandlerScope::Named);
        assert!(fault.panicked);
        assert_eq!(fault.message, "handler exploded");
    }

    #[test]
    fn test_counts_and_names() {
        let bus = EventBus::new();
        bus.on("chat", |_p| async { Ok(()) }.boxed());
        bus.on("chat", |_p| async { Ok(()) }.boxed());
        bus.on("abilities", |_p| async { Ok(()) }.boxed());

        assert_eq!(bus.named_count("chat"), 2);
        assert_eq!(bus.named_count("missing"), 0);
        assert_eq!(bus.handler_names(), vec!["abilities", "chat"]);
        assert!(!bus.is_passthrough("chat"));
        assert!(bus.is_passthrough("missing"));
    }

    #[test]
    fn test_fault_display() {
        let fault = HandlerFault {
            scope: HandlerScope::Named,
            index: 2,
            message: "boom".into(),
            panicked: true,
        };
        assert_eq!(fault.to_string(), "Named handler #2 panicked: boom");
    }
}
