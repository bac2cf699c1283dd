//! Named, multiplexed channels over one ordered link.
//!
//! The orchestrator and the session worker are joined by a single [`Link`].
//! Each side wraps its end in a [`ChannelHub`], which hands out typed
//! [`Channel`]s and routes inbound [`Envelope`]s to them by id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐            Link             ┌──────────────────┐
//! │ Orchestrator     │   Envelope { channel, data } │ Worker           │
//! │  ChannelHub ─────┼─────────────────────────────►│  ChannelHub      │
//! │   "internal.proxy"◄─────────────────────────────┼   "internal.proxy"│
//! │   "chat.relay"   │                              │   "chat.relay"   │
//! └──────────────────┘                              └──────────────────┘
//! ```
//!
//! # Delivery
//!
//! - Writes are fire-and-forget; there is no acknowledgement and no
//!   backpressure.
//! - One channel's messages arrive in the order they were written.
//! - Envelopes for an id with no channel on the receiving side are dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, panic_message};
use crate::protocol::Envelope;

// ============================================================================
// Types
// ============================================================================

/// Delivers a raw payload to one channel's subscribers.
type Route = Arc<dyn Fn(Value) + Send + Sync>;

/// Map of channel ids to their routes.
type RouteMap = FxHashMap<String, Route>;

/// Subscriber callback of a channel.
type Subscriber<R> = Arc<dyn Fn(R) + Send + Sync>;

// ============================================================================
// Link
// ============================================================================

/// One end of an ordered duplex link.
pub struct Link {
    /// Outbound half.
    tx: mpsc::UnboundedSender<Envelope>,
    /// Inbound half.
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// Creates a connected pair of link ends.
#[must_use]
pub fn link() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
}

// ============================================================================
// ChannelHub
// ============================================================================

/// One side's registry of channels over a [`Link`].
///
/// Cloning a hub yields another handle to the same registry.
#[derive(Clone)]
pub struct ChannelHub {
    /// Outbound half of the link, shared with every channel.
    tx: mpsc::UnboundedSender<Envelope>,
    /// Routes by channel id (shared with the router task).
    routes: Arc<RwLock<RouteMap>>,
    /// Router task handle.
    router: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Set to `true` once the inbound half is exhausted or the hub shuts down.
    closed_tx: Arc<watch::Sender<bool>>,
    /// Observer of `closed_tx`.
    closed: watch::Receiver<bool>,
}

impl fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHub")
            .field("channels", &self.routes.read().len())
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl ChannelHub {
    /// Wraps a link end and starts routing its inbound envelopes.
    ///
    /// Must be called from within a tokio runtime; the router task runs on it.
    #[must_use]
    pub fn new(link: Link) -> Self {
        let Link { tx, rx } = link;
        let routes = Arc::new(RwLock::new(RouteMap::default()));
        let (closed_tx, closed) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let router = tokio::spawn(Self::run_router(
            rx,
            Arc::clone(&routes),
            Arc::clone(&closed_tx),
        ));

        Self {
            tx,
            routes,
            router: Arc::new(Mutex::new(Some(router))),
            closed_tx,
            closed,
        }
    }

    /// Allocates a channel with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelExists`] if this hub already has a channel
    /// with the same id.
    pub fn create_channel<S, R>(&self, id: impl Into<String>) -> Result<Channel<S, R>>
    where
        S: Serialize,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        let id = id.into();
        let mut routes = self.routes.write();

        if routes.contains_key(&id) {
            return Err(Error::channel_exists(id));
        }

        let subscribers: Arc<RwLock<Vec<Subscriber<R>>>> = Arc::new(RwLock::new(Vec::new()));

        let route_subscribers = Arc::clone(&subscribers);
        let route_id = id.clone();
        let route: Route = Arc::new(move |data: Value| {
            let value = match serde_json::from_value::<R>(data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(channel = %route_id, error = %e, "Dropping undecodable channel payload");
                    return;
                }
            };

            // Snapshot so a subscriber may subscribe further callbacks.
            let snapshot: Vec<Subscriber<R>> = route_subscribers.read().clone();
            for (index, subscriber) in snapshot.into_iter().enumerate() {
                let value = value.clone();
                // A panicking subscriber must not take the router down with it.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber(value))) {
                    warn!(
                        channel = %route_id,
                        subscriber = index,
                        panic = %panic_message(payload.as_ref()),
                        "Channel subscriber panicked"
                    );
                }
            }
        });

        routes.insert(id.clone(), route);
        debug!(channel = %id, "Channel created");

        Ok(Channel {
            id: Arc::from(id),
            tx: self.tx.clone(),
            subscribers,
            _send: PhantomData,
        })
    }

    /// Returns `true` if a channel with this id exists.
    #[inline]
    #[must_use]
    pub fn has_channel(&self, id: &str) -> bool {
        self.routes.read().contains_key(id)
    }

    /// Returns the ids of all channels, sorted.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns `true` once inbound routing has stopped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until inbound routing stops.
    ///
    /// Routing stops when every sender on the other side is gone or when
    /// [`ChannelHub::shutdown`] is called.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Stops routing inbound envelopes.
    pub fn shutdown(&self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
            debug!("Channel router stopped");
        }
        self.closed_tx.send_replace(true);
    }

    /// Router task: delivers inbound envelopes to the matching channel.
    async fn run_router(
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        routes: Arc<RwLock<RouteMap>>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) {
        while let Some(envelope) = rx.recv().await {
            let route = routes.read().get(&envelope.channel).cloned();

            match route {
                Some(route) => route(envelope.data),
                None => trace!(channel = %envelope.channel, "No channel for envelope"),
            }
        }

        debug!("Link closed, channel router terminated");
        closed_tx.send_replace(true);
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A typed, named channel.
///
/// `S` is the type written to the other side, `R` the type received from it.
pub struct Channel<S, R> {
    /// Channel id, unique within its hub.
    id: Arc<str>,
    /// Outbound half of the shared link.
    tx: mpsc::UnboundedSender<Envelope>,
    /// Local subscribers, in registration order.
    subscribers: Arc<RwLock<Vec<Subscriber<R>>>>,
    _send: PhantomData<fn(S)>,
}

impl<S, R> Clone for Channel<S, R> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            tx: self.tx.clone(),
            subscribers: Arc::clone(&self.subscribers),
            _send: PhantomData,
        }
    }
}

impl<S, R> fmt::Debug for Channel<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl<S, R> Channel<S, R>
where
    S: Serialize,
{
    /// Returns the channel id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends a value to the other side.
    ///
    /// Does not wait for delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the value cannot be serialized
    /// - [`Error::ChannelClosed`] if the other side is gone
    pub fn write(&self, value: S) -> Result<()> {
        let data = serde_json::to_value(value)?;

        self.tx
            .send(Envelope::new(self.id.as_ref(), data))
            .map_err(|_| {
                debug!(channel = %self.id, "Write on closed link");
                Error::ChannelClosed
            })
    }

    /// Registers a local receiver for values from the other side.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(R) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    /// Returns the number of local subscribers.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    async fn recv_all<T>(rx: &mut mpsc::UnboundedReceiver<T>, count: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let item = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("delivery timed out")
                .expect("sender dropped");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_write_reaches_same_id_in_order() {
        let (left, right) = link();
        let left = ChannelHub::new(left);
        let right = ChannelHub::new(right);

        let sender = left.create_channel::<u32, u32>("a").unwrap();
        let receiver = right.create_channel::<u32, u32>("a").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.subscribe(move |value| {
            let _ = tx.send(value);
        });

        for i in 0..50 {
            sender.write(i).unwrap();
        }

        let received = recv_all(&mut rx, 50).await;
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let (left, right) = link();
        let left = ChannelHub::new(left);
        let right = ChannelHub::new(right);

        let a_out = left.create_channel::<String, String>("a").unwrap();
        let b_out = left.create_channel::<String, String>("b").unwrap();
        let b_in = right.create_channel::<String, String>("b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b_in.subscribe(move |value| {
            let _ = tx.send(value);
        });

        a_out.write("for a".to_string()).unwrap();
        b_out.write("for b".to_string()).unwrap();

        let received = recv_all(&mut rx, 1).await;
        assert_eq!(received, vec!["for b".to_string()]);

        // Nothing else shows up on "b".
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_run_in_registration_order() {
        let (left, right) = link();
        let left = ChannelHub::new(left);
        let right = ChannelHub::new(right);

        let out = left.create_channel::<u8, u8>("order").unwrap();
        let inbound = right.create_channel::<u8, u8>("order").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for tag in ["first", "second", "third"] {
            let tx = tx.clone();
            inbound.subscribe(move |_| {
                let _ = tx.send(tag);
            });
        }

        out.write(1).unwrap();

        let received = recv_all(&mut rx, 3).await;
        assert_eq!(received, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (left, _right) = link();
        let hub = ChannelHub::new(left);

        hub.create_channel::<u8, u8>("dup").unwrap();
        let err = hub.create_channel::<u8, u8>("dup").unwrap_err();
        assert!(matches!(err, Error::ChannelExists { ref id } if id == "dup"));
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped_silently() {
        let (left, right) = link();
        let left = ChannelHub::new(left);
        let right = ChannelHub::new(right);

        let orphan = left.create_channel::<u8, u8>("orphan").unwrap();
        let known_out = left.create_channel::<u8, u8>("known").unwrap();
        let known_in = right.create_channel::<u8, u8>("known").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        known_in.subscribe(move |value| {
            let _ = tx.send(value);
        });

        orphan.write(1).unwrap();
        known_out.write(2).unwrap();

        assert_eq!(recv_all(&mut rx, 1).await, vec![2]);
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn test_panicking_subscriber_keeps_router_alive() {
        let (left, right) = link();
        let left = ChannelHub::new(left);
        let right = ChannelHub::new(right);

        let boom_out = left.create_channel::<u8, u8>("boom").unwrap();
        let boom_in = right.create_channel::<u8, u8>("boom").unwrap();
        let other_out = left.create_channel::<u8, u8>("other").unwrap();
        let other_in = right.create_channel::<u8, u8>("other").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        boom_in.subscribe(|_| panic!("subscriber bug"));
        {
            let tx = tx.clone();
            boom_in.subscribe(move |value| {
                let _ = tx.send(("boom", value));
            });
        }
        other_in.subscribe(move |value| {
            let _ = tx.send(("other", value));
        });

        boom_out.write(1).unwrap();
        boom_out.write(2).unwrap();
        other_out.write(3).unwrap();

        // Later subscribers of the same channel still run, and so does
        // every other channel of the hub.
        assert_eq!(
            recv_all(&mut rx, 3).await,
            vec![("boom", 1), ("boom", 2), ("other", 3)]
        );
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_peer_dropped_fails() {
        let (left, right) = link();
        let hub = ChannelHub::new(left);
        let channel = hub.create_channel::<u8, u8>("a").unwrap();

        drop(right);

        assert!(matches!(channel.write(1), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_closed_resolves_when_peer_dropped() {
        let (left, right) = link();
        let hub = ChannelHub::new(left);

        drop(right);

        timeout(Duration::from_secs(1), hub.closed())
            .await
            .expect("hub should observe closed link");
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_channel_ids_sorted() {
        let (left, _right) = link();
        let hub = ChannelHub::new(left);
        hub.create_channel::<u8, u8>("zeta").unwrap();
        hub.create_channel::<u8, u8>("alpha").unwrap();

        assert_eq!(hub.channel_ids(), vec!["alpha", "zeta"]);
        assert!(hub.has_channel("alpha"));
        assert!(!hub.has_channel("beta"));
    }
}
