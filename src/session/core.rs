//! Session orchestrator.
//!
//! A [`Session`] owns one client connection, one target connection and one
//! isolated worker. It relays packets between the peers through the
//! worker's interception pipeline and tears everything down when any part
//! ends.
//!
//! # Data Flow
//!
//! ```text
//!  client ──► pump ──► internal.proxy {upstream} ──► worker Proxy ──┐
//!                                                                   │
//!  target ◄── forwarder ◄── internal.proxy {upstream} ◄─────────────┘
//!
//!  target ──► pump ──► internal.proxy {downstream} ──► worker Proxy ─┐
//!                                                                    │
//!  client ◄── forwarder ◄── internal.proxy {downstream} ◄────────────┘
//! ```
//!
//! # Startup
//!
//! 1. Build the orchestrator [`ChannelHub`] and subscribe the forwarders
//! 2. Spawn the worker; it loads primary entries and starts dispatch
//! 3. Load secondary entries with `&Session`
//! 4. Start the pumps
//!
//! # Teardown
//!
//! See [`super::teardown`]. The first of client closed, target closed,
//! worker exited or [`Session::close`] wins.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::TargetOptions;
use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::pipeline::PipelineChannel;
use crate::plugin::{LoadReport, PluginLoader};
use crate::protocol::{Direction, PROXY_CHANNEL, PipelineMessage};
use crate::transport::{
    Channel, ChannelHub, PeerConnection, PeerEvent, connect_target, disconnect, link, login_success,
};

use super::events::{EVENT_CAPACITY, SessionEvent};
use super::teardown::{Lifecycle, SessionState, TeardownReason};
use super::worker::{
    NoticeChannel, WORKER_CHANNEL, WorkerExit, WorkerHandle, WorkerNotice, wait_exit,
};

// ============================================================================
// Session
// ============================================================================

/// One proxied client.
///
/// Cloning a session yields another handle to the same session.
///
/// # Example
///
/// ```ignore
/// let session = Session::start("Steve", client, target, loader).await?;
/// let mut events = session.subscribe_events();
///
/// session.closed().await;
/// println!("closed: {:?}", session.close_reason());
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Shared session state.
struct SessionInner {
    id: SessionId,
    username: String,
    client: Arc<PeerConnection>,
    target: Arc<PeerConnection>,
    /// Orchestrator side of the link.
    hub: ChannelHub,
    worker: Mutex<Option<WorkerHandle>>,
    worker_startup: Duration,
    lifecycle: Lifecycle,
    events: broadcast::Sender<SessionEvent>,
    /// Receiver created before the first event, handed to the first subscriber.
    first_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    /// Teardown trigger input.
    triggers: mpsc::UnboundedSender<TeardownReason>,
    /// Pumps and monitors, aborted on teardown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    primary_report: LoadReport,
    secondary_report: Mutex<Option<LoadReport>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("username", &self.inner.username)
            .field("state", &self.inner.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Connects to the target, logs in and starts a session.
    ///
    /// Logs into the target with the configured username, or the client's
    /// when none is set.
    ///
    /// # Errors
    ///
    /// - Connection and login errors from the target
    /// - Any error from [`Session::start`]
    pub async fn open(
        client: PeerConnection,
        username: &str,
        options: &TargetOptions,
        loader: PluginLoader,
    ) -> Result<Self> {
        let target = connect_target(options, username).await?;
        Self::start(username, client, target, loader).await
    }

    /// Starts a session over two logged-in peers.
    ///
    /// Returns once primary and secondary entries are loaded and packets
    /// flow.
    ///
    /// # Errors
    ///
    /// - [`Error::Worker`] if the worker fails to start or dies while loading
    /// - [`Error::PluginContract`] / [`Error::PluginActivation`] if loading
    ///   aborts (no error hook installed)
    pub async fn start(
        username: impl Into<String>,
        client: PeerConnection,
        target: PeerConnection,
        loader: PluginLoader,
    ) -> Result<Self> {
        Self::launch(username.into(), client, target, loader, false).await
    }

    /// Starts a session and answers the client's pending login.
    ///
    /// Like [`Session::start`], but sends `login_success` to the client
    /// right before packets start to flow, or a `disconnect` carrying the
    /// error if startup fails.
    ///
    /// # Errors
    ///
    /// Same as [`Session::start`].
    pub async fn start_login(
        username: impl Into<String>,
        client: PeerConnection,
        target: PeerConnection,
        loader: PluginLoader,
    ) -> Result<Self> {
        Self::launch(username.into(), client, target, loader, true).await
    }

    async fn launch(
        username: String,
        client: PeerConnection,
        target: PeerConnection,
        loader: PluginLoader,
        answer_login: bool,
    ) -> Result<Self> {
        let id = SessionId::next();
        let client = Arc::new(client);
        let target = Arc::new(target);

        debug!(session_id = %id, %username, "Starting session");

        // Orchestrator side of the link, ready before the worker writes.
        let (ours, theirs) = link();
        let hub = ChannelHub::new(ours);
        let channels = hub
            .create_channel(PROXY_CHANNEL)
            .and_then(|pipeline: PipelineChannel| {
                let notices: NoticeChannel = hub.create_channel(WORKER_CHANNEL)?;
                Ok((pipeline, notices))
            });
        let (pipeline, notices) = match channels {
            Ok(channels) => channels,
            Err(e) => {
                refuse_login(&client, answer_login, &e);
                return Err(e);
            }
        };

        {
            let client = Arc::clone(&client);
            let target = Arc::clone(&target);
            pipeline.subscribe(move |message: PipelineMessage| {
                let peer = match message.direction {
                    Direction::Upstream => &target,
                    Direction::Downstream => &client,
                };
                if peer.send(message.packet).is_err() {
                    trace!(session_id = %id, direction = %message.direction, "Peer gone, packet dropped");
                }
            });
        }

        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        notices.subscribe(move |notice| {
            let _ = notice_tx.send(notice);
        });

        let (worker, worker_startup) = match WorkerHandle::spawn(id, theirs, loader.clone()).await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                refuse_login(&client, answer_login, &e);
                hub.shutdown();
                return Err(e);
            }
        };

        let primary_report = match wait_loaded(&worker, &mut notice_rx).await {
            Ok(report) => report,
            Err(e) => {
                error!(session_id = %id, error = %e, "Session startup failed");
                refuse_login(&client, answer_login, &e);
                hub.shutdown();
                let _ = worker.stop().await;
                return Err(e);
            }
        };

        let (events, first_events) = broadcast::channel(EVENT_CAPACITY);
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                username,
                client,
                target,
                hub,
                worker: Mutex::new(None),
                worker_startup,
                lifecycle: Lifecycle::new(),
                events,
                first_events: Mutex::new(Some(first_events)),
                triggers,
                tasks: Mutex::new(Vec::new()),
                primary_report: primary_report.clone(),
                secondary_report: Mutex::new(None),
            }),
        };
        let inner = &session.inner;

        inner.emit(SessionEvent::WorkerOnline {
            session_id: id,
            startup: worker_startup,
        });
        inner.emit_report(&primary_report);

        // Monitors run before secondary loading so a dying worker is noticed.
        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn(monitor_worker(
                id,
                worker.exit_watch(),
                inner.events.clone(),
                inner.triggers.clone(),
            )));
            tasks.push(tokio::spawn(forward_notices(
                id,
                notice_rx,
                inner.events.clone(),
            )));
        }
        *inner.worker.lock() = Some(worker);

        // Not tracked in `tasks`: it must outlive the abort in teardown.
        tokio::spawn(supervise(Arc::clone(inner), trigger_rx));

        match loader.load_secondary(&session).await {
            Ok(report) => {
                inner.emit_report(&report);
                *inner.secondary_report.lock() = Some(report);
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "Secondary plugin loading aborted");
                refuse_login(&inner.client, answer_login, &e);
                inner.teardown(TeardownReason::Shutdown).await;
                return Err(e);
            }
        }

        {
            let mut tasks = inner.tasks.lock();
            if inner.lifecycle.state().is_terminating() {
                let e = Error::worker("session closed during startup");
                refuse_login(&inner.client, answer_login, &e);
                return Err(e);
            }

            // Queued ahead of anything the pumps relay.
            if answer_login && inner.client.send(login_success(&inner.username)).is_err() {
                debug!(session_id = %id, "Client gone before login completed");
            }

            tasks.push(tokio::spawn(pump(
                id,
                Arc::clone(&inner.client),
                Direction::Upstream,
                pipeline.clone(),
                inner.events.clone(),
                inner.triggers.clone(),
            )));
            tasks.push(tokio::spawn(pump(
                id,
                Arc::clone(&inner.target),
                Direction::Downstream,
                pipeline,
                inner.events.clone(),
                inner.triggers.clone(),
            )));
        }

        inner.lifecycle.mark_running();
        info!(
            session_id = %id,
            username = %inner.username,
            startup_ms = worker_startup.as_secs_f64() * 1000.0,
            "Session running"
        );

        Ok(session)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Returns the client's username.
    #[inline]
    #[must_use]
    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Returns the time the worker took to come online.
    #[inline]
    #[must_use]
    pub fn worker_startup(&self) -> Duration {
        self.inner.worker_startup
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.state()
    }

    /// Returns what started the teardown, once it has begun.
    #[inline]
    #[must_use]
    pub fn close_reason(&self) -> Option<TeardownReason> {
        self.inner.lifecycle.reason()
    }

    /// Returns the primary load pass result.
    #[inline]
    #[must_use]
    pub fn primary_report(&self) -> &LoadReport {
        &self.inner.primary_report
    }

    /// Returns the secondary load pass result, once it has finished.
    #[must_use]
    pub fn secondary_report(&self) -> Option<LoadReport> {
        self.inner.secondary_report.lock().clone()
    }

    /// Subscribes to session events.
    ///
    /// The first subscriber after [`Session::start`] returns also receives
    /// the events published during startup. Secondary plugin entries
    /// subscribing while the session is still starting get a receiver of
    /// later events only.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        if self.inner.lifecycle.state() == SessionState::Starting {
            return self.inner.events.subscribe();
        }

        self.inner
            .first_events
            .lock()
            .take()
            .unwrap_or_else(|| self.inner.events.subscribe())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Allocates a channel on the orchestrator side.
    ///
    /// A worker channel with the same id is its other end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelExists`] if the id is taken.
    pub fn create_channel<S, R>(&self, id: impl Into<String>) -> Result<Channel<S, R>>
    where
        S: Serialize,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        self.inner.hub.create_channel(id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes the session and waits until it is fully torn down.
    ///
    /// Idempotent; a session already closing is awaited.
    pub async fn close(&self) {
        self.inner.teardown(TeardownReason::Shutdown).await;
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        self.inner.lifecycle.closed().await;
    }
}

// ============================================================================
// SessionInner
// ============================================================================

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_report(&self, report: &LoadReport) {
        for (module, message) in &report.failures {
            self.emit(SessionEvent::PluginError {
                session_id: self.id,
                module: module.clone(),
                message: message.clone(),
            });
        }
        self.emit(SessionEvent::PluginsLoaded {
            session_id: self.id,
            report: report.clone(),
        });
    }

    /// Runs the teardown sequence once; later callers wait for it.
    async fn teardown(&self, reason: TeardownReason) {
        if !self.lifecycle.begin_close(reason) {
            self.lifecycle.closed().await;
            return;
        }

        info!(session_id = %self.id, %reason, "Session closing");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.client.shutdown();
        self.target.shutdown();
        self.hub.shutdown();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let exit = worker.stop().await;
            if exit.is_abnormal() {
                warn!(session_id = %self.id, %exit, "Worker exited abnormally");
            }
        }

        self.lifecycle.finish_close();
        self.emit(SessionEvent::Closed {
            session_id: self.id,
            reason,
        });

        info!(session_id = %self.id, %reason, "Session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.hub.shutdown();
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Tells a client waiting on its login that the session did not start.
fn refuse_login(client: &PeerConnection, answer_login: bool, err: &Error) {
    if answer_login && client.send(disconnect(&err.to_string())).is_err() {
        trace!("Client gone before login was refused");
    }
}

/// Waits for the worker's load notice.
async fn wait_loaded(
    worker: &WorkerHandle,
    notices: &mut mpsc::UnboundedReceiver<WorkerNotice>,
) -> Result<LoadReport> {
    let exit = wait_exit(worker.exit_watch());
    tokio::pin!(exit);

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Some(WorkerNotice::Loaded { report }) => return Ok(report),
                Some(WorkerNotice::LoadFailed { module: Some(module), message, contract: true }) => {
                    return Err(Error::plugin_contract(module, message));
                }
                Some(WorkerNotice::LoadFailed { module: Some(module), message, contract: false }) => {
                    return Err(Error::plugin_activation(module, message));
                }
                Some(WorkerNotice::LoadFailed { module: None, message, .. }) => {
                    return Err(Error::worker(message));
                }
                Some(WorkerNotice::HandlerFault { .. }) => continue,
                None => return Err(Error::worker("worker notices closed before loading")),
            },
            exit = &mut exit => {
                return Err(Error::worker(format!("worker exited while loading ({exit})")));
            }
        }
    }
}

/// Moves one peer's packets into the pipeline.
async fn pump(
    session_id: SessionId,
    peer: Arc<PeerConnection>,
    direction: Direction,
    pipeline: PipelineChannel,
    events: broadcast::Sender<SessionEvent>,
    triggers: mpsc::UnboundedSender<TeardownReason>,
) {
    let closed = match direction {
        Direction::Upstream => TeardownReason::ClientClosed,
        Direction::Downstream => TeardownReason::TargetClosed,
    };

    loop {
        match peer.next_event().await {
            Some(PeerEvent::Packet(packet)) => {
                trace!(%session_id, %direction, packet = %packet.name, "Packet in");
                if pipeline
                    .write(PipelineMessage::new(direction, packet))
                    .is_err()
                {
                    debug!(%session_id, %direction, "Pipeline link closed");
                    let _ = triggers.send(TeardownReason::WorkerExited);
                    return;
                }
            }
            Some(PeerEvent::Error(message)) => {
                warn!(%session_id, %direction, error = %message, "Peer connection error");
                let event = match direction {
                    Direction::Upstream => SessionEvent::ClientError {
                        session_id,
                        message,
                    },
                    Direction::Downstream => SessionEvent::TargetError {
                        session_id,
                        message,
                    },
                };
                let _ = events.send(event);
            }
            Some(PeerEvent::Closed) | None => break,
        }
    }

    debug!(%session_id, %direction, "Peer closed");
    let _ = triggers.send(closed);
}

/// Reports the worker's exit.
async fn monitor_worker(
    session_id: SessionId,
    exit: watch::Receiver<Option<WorkerExit>>,
    events: broadcast::Sender<SessionEvent>,
    triggers: mpsc::UnboundedSender<TeardownReason>,
) {
    let exit = wait_exit(exit).await;
    if exit.is_abnormal() {
        error!(%session_id, %exit, "Worker died");
        let _ = events.send(SessionEvent::WorkerError {
            session_id,
            message: exit.to_string(),
        });
    }
    let _ = triggers.send(TeardownReason::WorkerExited);
}

/// Republishes worker notices as session events.
async fn forward_notices(
    session_id: SessionId,
    mut notices: mpsc::UnboundedReceiver<WorkerNotice>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(notice) = notices.recv().await {
        match notice {
            WorkerNotice::HandlerFault {
                direction,
                packet,
                fault,
            } => {
                let _ = events.send(SessionEvent::HandlerFault {
                    session_id,
                    direction,
                    packet,
                    fault,
                });
            }
            other => trace!(%session_id, notice = ?other, "Ignoring late worker notice"),
        }
    }
}

/// Runs teardown on the first trigger.
async fn supervise(inner: Arc<SessionInner>, mut triggers: mpsc::UnboundedReceiver<TeardownReason>) {
    tokio::select! {
        reason = triggers.recv() => {
            if let Some(reason) = reason {
                inner.teardown(reason).await;
            }
        }
        () = inner.lifecycle.closed() => {}
    }
}

// ============================================================================
// Tests
// ============================================================================
