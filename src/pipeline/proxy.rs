//! Per-session packet interception pipeline.
//!
//! A [`Proxy`] lives inside the session worker. It receives
//! [`PipelineMessage`]s from the orchestrator over the `internal.proxy`
//! channel, runs them through the [`EventBus`] of their direction, and writes
//! survivors back on the same channel to be relayed to the real peer.
//!
//! # Dispatch
//!
//! ```text
//! internal.proxy ──► queue(upstream)   ──► dispatch task ──► internal.proxy
//!                └─► queue(downstream) ──► dispatch task ──┘
//! ```
//!
//! Each direction has its own queue drained by one task, so packet N's full
//! handler chain completes before packet N+1 of the same direction starts.
//! The two directions run concurrently.
//!
//! # Injection
//!
//! [`Proxy::emit`] writes a fresh packet straight to the outbound channel.
//! Injected packets never pass through any handler.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{HandlerResult, Result};
use crate::protocol::{Direction, Packet, PipelineMessage, ProtocolState, RawPacket};
use crate::transport::Channel;

use super::bus::{EventBus, HandlerFault};

// ============================================================================
// Types
// ============================================================================

/// The pipeline's channel: pipeline messages in both directions.
pub type PipelineChannel = Channel<PipelineMessage, PipelineMessage>;

/// Callback invoked when a handler faults.
///
/// Receives the direction, the packet name and the fault.
pub type FaultObserver = Arc<dyn Fn(Direction, &str, &HandlerFault) + Send + Sync>;

/// Receivers of the per-direction queues, taken when dispatch starts.
type Queues = (
    mpsc::UnboundedReceiver<Packet>,
    mpsc::UnboundedReceiver<Packet>,
);

// ============================================================================
// DispatchOutcome
// ============================================================================

/// Terminal state of one dispatched packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Written back to the outbound channel.
    Forwarded,
    /// Canceled by a handler and dropped.
    Canceled,
    /// A handler failed; the packet was dropped.
    Faulted(HandlerFault),
    /// The packet survived but the outbound channel is closed.
    Closed,
}

impl DispatchOutcome {
    /// Returns `true` if the packet was forwarded.
    #[inline]
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Self::Forwarded)
    }
}

// ============================================================================
// PipelineStats
// ============================================================================

/// Counters of one direction.
#[derive(Debug, Default)]
struct DirectionCounters {
    dispatched: AtomicU64,
    forwarded: AtomicU64,
    canceled: AtomicU64,
    faulted: AtomicU64,
    injected: AtomicU64,
}

impl DirectionCounters {
    fn snapshot(&self) -> DirectionStats {
        DirectionStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionStats {
    /// Packets that entered dispatch.
    pub dispatched: u64,
    /// Packets written back after dispatch.
    pub forwarded: u64,
    /// Packets canceled by a handler.
    pub canceled: u64,
    /// Packets dropped because a handler failed.
    pub faulted: u64,
    /// Packets written through [`Proxy::emit`].
    pub injected: u64,
}

/// Point-in-time counters of both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Client to target.
    pub upstream: DirectionStats,
    /// Target to client.
    pub downstream: DirectionStats,
}

impl PipelineStats {
    /// Returns the counters of one direction.
    #[inline]
    #[must_use]
    pub fn direction(&self, direction: Direction) -> DirectionStats {
        match direction {
            Direction::Upstream => self.upstream,
            Direction::Downstream => self.downstream,
        }
    }
}

// ============================================================================
// ConnectionSide
// ============================================================================

/// One direction of the pipeline.
///
/// Plugins register handlers here and inject packets travelling the same
/// way.
pub struct ConnectionSide {
    direction: Direction,
    bus: EventBus,
    outbound: PipelineChannel,
    counters: DirectionCounters,
}

impl fmt::Debug for ConnectionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSide")
            .field("direction", &self.direction)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl ConnectionSide {
    fn new(direction: Direction, outbound: PipelineChannel) -> Self {
        Self {
            direction,
            bus: EventBus::new(),
            outbound,
            counters: DirectionCounters::default(),
        }
    }

    /// Returns the direction of this side.
    #[inline]
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the handler registry of this side.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Registers a handler for every packet of this direction.
    pub fn on_packet<F>(&self, handler: F)
    where
        F: for<'a> Fn(&'a mut Packet) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.bus.on_packet(handler);
    }

    /// Registers a handler for packets named `name` in this direction.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: for<'a> Fn(&'a mut Packet) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.bus.on(name, handler);
    }

    /// Injects a packet in this direction without dispatching it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelClosed`] if the orchestrator is gone.
    pub fn write(
        &self,
        name: impl Into<String>,
        data: Value,
        state: Option<ProtocolState>,
    ) -> Result<()> {
        let packet = RawPacket::new(name, data, state);
        trace!(direction = %self.direction, packet = %packet.name, "Injecting packet");

        self.outbound
            .write(PipelineMessage::new(self.direction, packet))?;
        self.counters.injected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Per-session interception pipeline.
///
/// # Example
///
/// ```ignore
/// let proxy = Proxy::new(channel);
/// proxy.upstream().on("chat", |packet| {
///     async move {
///         packet.set("message", "[redacted]");
///         Ok(())
///     }
///     .boxed()
/// });
/// proxy.start();
/// ```
pub struct Proxy {
    upstream: ConnectionSide,
    downstream: ConnectionSide,
    /// Packets received before dispatch starts wait here.
    queues: Mutex<Option<Queues>>,
    fault_observer: RwLock<Option<FaultObserver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Attaches a pipeline to its channel.
    ///
    /// Inbound messages are queued immediately but not dispatched until
    /// [`Proxy::start`] is called.
    #[must_use]
    pub fn new(channel: PipelineChannel) -> Arc<Self> {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel::<Packet>();
        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel::<Packet>();

        channel.subscribe(move |message: PipelineMessage| {
            let queue = match message.direction {
                Direction::Upstream => &upstream_tx,
                Direction::Downstream => &downstream_tx,
            };
            if queue.send(Packet::from(message.packet)).is_err() {
                trace!(direction = %message.direction, "Pipeline stopped, packet dropped");
            }
        });

        Arc::new(Self {
            upstream: ConnectionSide::new(Direction::Upstream, channel.clone()),
            downstream: ConnectionSide::new(Direction::Downstream, channel),
            queues: Mutex::new(Some((upstream_rx, downstream_rx))),
            fault_observer: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Returns the client-to-target side.
    #[inline]
    #[must_use]
    pub fn upstream(&self) -> &ConnectionSide {
        &self.upstream
    }

    /// Returns the target-to-client side.
    #[inline]
    #[must_use]
    pub fn downstream(&self) -> &ConnectionSide {
        &self.downstream
    }

    /// Returns the side handling `direction`.
    #[inline]
    #[must_use]
    pub fn side(&self, direction: Direction) -> &ConnectionSide {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    /// Sets the callback invoked on handler faults.
    pub fn on_fault<F>(&self, observer: F)
    where
        F: Fn(Direction, &str, &HandlerFault) + Send + Sync + 'static,
    {
        *self.fault_observer.write() = Some(Arc::new(observer));
    }

    /// Returns `true` once dispatch has started.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.queues.lock().is_none()
    }

    /// Starts one dispatch task per direction.
    ///
    /// Must be called from within a tokio runtime. Calling it again is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let Some((upstream_rx, downstream_rx)) = self.queues.lock().take() else {
            return;
        };

        let mut tasks = self.tasks.lock();
        for (direction, rx) in [
            (Direction::Upstream, upstream_rx),
            (Direction::Downstream, downstream_rx),
        ] {
            tasks.push(tokio::spawn(Arc::clone(self).run_dispatch(direction, rx)));
        }

        debug!("Pipeline dispatch started");
    }

    /// Stops the dispatch tasks.
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        if !tasks.is_empty() {
            debug!("Pipeline dispatch stopped");
        }
    }

    /// Dispatch task: drains one direction's queue in order.
    async fn run_dispatch(
        self: Arc<Self>,
        direction: Direction,
        mut rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        while let Some(packet) = rx.recv().await {
            if self.dispatch(direction, packet).await == DispatchOutcome::Closed {
                break;
            }
        }

        debug!(%direction, "Dispatch task terminated");
    }

    /// Runs one packet through its direction's handlers.
    ///
    /// Forwards the packet unless a handler canceled it or failed.
    pub async fn dispatch(&self, direction: Direction, mut packet: Packet) -> DispatchOutcome {
        let side = self.side(direction);
        side.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        if let Err(fault) = side.bus.emit(&mut packet).await {
            side.counters.faulted.fetch_add(1, Ordering::Relaxed);
            warn!(
                %direction,
                packet = %packet.name,
                fault = %fault,
                "Handler fault, packet dropped"
            );

            let observer = self.fault_observer.read().clone();
            if let Some(observer) = observer {
                observer(direction, &packet.name, &fault);
            }
            return DispatchOutcome::Faulted(fault);
        }

        if packet.is_canceled() {
            side.counters.canceled.fetch_add(1, Ordering::Relaxed);
            trace!(%direction, packet = %packet.name, "Packet canceled");
            return DispatchOutcome::Canceled;
        }

        let message = PipelineMessage::new(direction, RawPacket::from(packet));
        match side.outbound.write(message) {
            Ok(()) => {
                side.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Forwarded
            }
            Err(e) => {
                debug!(%direction, error = %e, "Outbound channel closed");
                DispatchOutcome::Closed
            }
        }
    }

    /// Injects a packet without dispatching it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelClosed`] if the orchestrator is gone.
    pub fn emit(
        &self,
        direction: Direction,
        name: impl Into<String>,
        data: Value,
        state: Option<ProtocolState>,
    ) -> Result<()> {
        self.side(direction).write(name, data, state)
    }

    /// Injects a packet towards the target.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelClosed`] if the orchestrator is gone.
    #[inline]
    pub fn write_upstream(&self, name: impl Into<String>, data: Value) -> Result<()> {
        self.upstream.write(name, data, None)
    }

    /// Injects a packet towards the client.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelClosed`] if the orchestrator is gone.
    #[inline]
    pub fn write_downstream(&self, name: impl Into<String>, data: Value) -> Result<()> {
        self.downstream.write(name, data, None)
    }

    /// Returns a snapshot of the pipeline counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            upstream: self.upstream.counters.snapshot(),
            downstream: self.downstream.counters.snapshot(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
