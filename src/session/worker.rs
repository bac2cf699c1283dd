//! Session worker: the isolated execution unit.
//!
//! Each session runs its interception pipeline and primary plugin entries on
//! a dedicated OS thread with its own current-thread tokio runtime. The
//! worker talks to the orchestrator only through its end of the session
//! [`Link`].
//!
//! # Startup
//!
//! ```text
//! orchestrator                         worker thread
//!     │ spawn ─────────────────────────────►│ build runtime
//!     │◄──────────────────────────── online │
//!     │   (startup latency recorded)        │ ChannelHub, Proxy
//!     │                                     │ load primary entries
//!     │◄──── internal.worker: Loaded ───────│ start dispatch
//!     │                                     │ run until shutdown
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ModuleId, SessionId};
use crate::pipeline::{HandlerFault, PipelineChannel, Proxy};
use crate::plugin::{LoadReport, PluginLoader};
use crate::protocol::{Direction, PROXY_CHANNEL};
use crate::transport::{Channel, ChannelHub, Link};

// ============================================================================
// Constants
// ============================================================================

/// Channel carrying worker status notices to the orchestrator.
pub const WORKER_CHANNEL: &str = "internal.worker";

/// Maximum time for the worker thread to come online.
const WORKER_ONLINE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// WorkerNotice
// ============================================================================

/// Status message sent by the worker on [`WORKER_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerNotice {
    /// Primary entries loaded; dispatch is running.
    Loaded {
        /// Load pass result.
        report: LoadReport,
    },
    /// Primary loading aborted; the worker is exiting.
    LoadFailed {
        /// Offending module, if known.
        module: Option<ModuleId>,
        /// Failure description.
        message: String,
        /// `true` for a contract violation, `false` for an activation failure.
        #[serde(default)]
        contract: bool,
    },
    /// A handler failed during dispatch.
    HandlerFault {
        /// Direction of the dropped packet.
        direction: Direction,
        /// Name of the dropped packet.
        packet: String,
        /// The fault.
        fault: HandlerFault,
    },
}

/// Orchestrator end of [`WORKER_CHANNEL`].
pub(crate) type NoticeChannel = Channel<WorkerNotice, WorkerNotice>;

// ============================================================================
// WorkerExit
// ============================================================================

/// How a worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shut down normally.
    Clean,
    /// Returned an error.
    Failed(String),
    /// Panicked.
    Panicked,
}

impl WorkerExit {
    /// Returns `true` unless the worker exited cleanly.
    #[inline]
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Clean)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Failed(message) => write!(f, "failed: {message}"),
            Self::Panicked => f.write_str("panicked"),
        }
    }
}

/// Publishes the exit status when the worker thread ends, even by panic.
struct ExitGuard {
    tx: watch::Sender<Option<WorkerExit>>,
    status: Option<WorkerExit>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let exit = if thread::panicking() {
            WorkerExit::Panicked
        } else {
            self.status.take().unwrap_or(WorkerExit::Clean)
        };
        self.tx.send_replace(Some(exit));
    }
}

// ============================================================================
// WorkerScope
// ============================================================================

/// What a primary plugin entry sees inside the worker.
#[derive(Clone)]
pub struct WorkerScope {
    session_id: SessionId,
    hub: ChannelHub,
    proxy: Arc<Proxy>,
}

impl fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScope")
            .field("session_id", &self.session_id)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl WorkerScope {
    pub(crate) fn new(session_id: SessionId, hub: ChannelHub, proxy: Arc<Proxy>) -> Self {
        Self {
            session_id,
            hub,
            proxy,
        }
    }

    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns this session's interception pipeline.
    #[inline]
    #[must_use]
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Allocates a channel on the worker side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelExists`] if the id is taken.
    pub fn create_channel<S, R>(&self, id: impl Into<String>) -> Result<Channel<S, R>>
    where
        S: Serialize,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        self.hub.create_channel(id)
    }
}

// ============================================================================
// WorkerHandle
// ============================================================================

/// Orchestrator-side handle of a running worker.
pub(crate) struct WorkerHandle {
    session_id: SessionId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<WorkerExit>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("session_id", &self.session_id)
            .field("exit", &*self.exit.borrow())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawns the worker thread and waits for it to come online.
    ///
    /// Returns the handle and the startup latency.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the thread cannot be spawned
    /// - [`Error::Worker`] if the worker does not come online in time
    pub(crate) async fn spawn(
        session_id: SessionId,
        link: Link,
        loader: PluginLoader,
    ) -> Result<(Self, Duration)> {
        let start = Instant::now();
        let (online_tx, online_rx) = oneshot::channel::<()>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (exit_tx, exit) = watch::channel(None);

        let thread = thread::Builder::new()
            .name(format!("session-worker-{session_id}"))
            .spawn(move || {
                let mut guard = ExitGuard {
                    tx: exit_tx,
                    status: None,
                };

                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(%session_id, error = %e, "Worker runtime failed to start");
                        guard.status = Some(WorkerExit::Failed(e.to_string()));
                        return;
                    }
                };

                let _ = online_tx.send(());

                if let Err(e) = rt.block_on(run(session_id, link, loader, shutdown_rx)) {
                    guard.status = Some(WorkerExit::Failed(e.to_string()));
                }
            })?;

        let handle = Self {
            session_id,
            shutdown: Mutex::new(Some(shutdown_tx)),
            exit,
            thread: Some(thread),
        };

        match timeout(WORKER_ONLINE_TIMEOUT, online_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(Error::worker(format!(
                    "worker exited before coming online ({})",
                    handle.exit_status().unwrap_or(WorkerExit::Panicked)
                )));
            }
            Err(_) => {
                return Err(Error::worker(format!(
                    "worker not online after {}ms",
                    WORKER_ONLINE_TIMEOUT.as_millis()
                )));
            }
        }

        let startup = start.elapsed();
        info!(
            %session_id,
            startup_ms = startup.as_secs_f64() * 1000.0,
            "Worker online"
        );

        Ok((handle, startup))
    }

    /// Returns the exit status, if the worker has exited.
    pub(crate) fn exit_status(&self) -> Option<WorkerExit> {
        self.exit.borrow().clone()
    }

    /// Returns a watcher that resolves when the worker exits.
    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit.clone()
    }

    /// Signals the worker to stop without waiting for it.
    pub(crate) fn request_stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Signals the worker to stop, waits for it and joins its thread.
    pub(crate) async fn stop(mut self) -> WorkerExit {
        self.request_stop();

        let exit = wait_exit(self.exit.clone()).await;

        if let Some(thread) = self.thread.take() {
            let session_id = self.session_id;
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(%session_id, "Worker thread join failed");
            }
        }

        debug!(session_id = %self.session_id, %exit, "Worker stopped");
        exit
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.get_mut().take() {
            let _ = tx.send(());
        }
    }
}

/// Waits for an exit status to be published.
pub(crate) async fn wait_exit(mut exit: watch::Receiver<Option<WorkerExit>>) -> WorkerExit {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => status.clone().unwrap_or(WorkerExit::Panicked),
        // Sender dropped without publishing: the thread is gone.
        Err(_) => WorkerExit::Panicked,
    }
}

// ============================================================================
// Worker Main
// ============================================================================

/// Worker body, run on the worker's runtime.
async fn run(
    session_id: SessionId,
    link: Link,
    loader: PluginLoader,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let hub = ChannelHub::new(link);
    let pipeline: PipelineChannel = hub.create_channel(PROXY_CHANNEL)?;
    let notices: NoticeChannel = hub.create_channel(WORKER_CHANNEL)?;

    let proxy = Proxy::new(pipeline);
    {
        let notices = notices.clone();
        proxy.on_fault(move |direction, packet, fault| {
            let _ = notices.write(WorkerNotice::HandlerFault {
                direction,
                packet: packet.to_string(),
                fault: fault.clone(),
            });
        });
    }

    let scope = WorkerScope::new(session_id, hub.clone(), Arc::clone(&proxy));

    match loader.load_primary(&scope).await {
        Ok(report) => {
            proxy.start();
            notices.write(WorkerNotice::Loaded { report })?;
        }
        Err(e) => {
            error!(%session_id, error = %e, "Primary plugin loading aborted");
            let (message, contract) = match &e {
                Error::PluginContract { message, .. } => (message.clone(), true),
                Error::PluginActivation { message, .. } => (message.clone(), false),
                other => (other.to_string(), false),
            };
            let _ = notices.write(WorkerNotice::LoadFailed {
                module: e.module().cloned(),
                message,
                contract,
            });
            hub.shutdown();
            return Err(e);
        }
    }

    tokio::select! {
        _ = shutdown => debug!(%session_id, "Worker shutdown requested"),
        () = hub.closed() => debug!(%session_id, "Worker link closed"),
    }

    proxy.stop();
    hub.shutdown();
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::PluginResult;
    use crate::plugin::{LoadHooks, ModuleSet, Plugin, PluginModule, PluginRegistry};
    use crate::protocol::{PipelineMessage, RawPacket};
    use crate::transport::link;

    #[derive(Default)]
    struct Stamp;

    #[async_trait]
    impl Plugin for Stamp {
        async fn activate(&self, scope: &WorkerScope) -> PluginResult {
            use futures_util::FutureExt;
            scope.proxy().upstream().on_packet(|packet| {
                async move {
                    packet.set("stamped", true);
                    Ok(())
                }
                .boxed()
            });
            Ok(())
        }
    }

    #[derive(Default)]
    struct Broken;

    #[async_trait]
    impl Plugin for Broken {
        async fn activate(&self, _scope: &WorkerScope) -> PluginResult {
            Err("no".into())
        }
    }

    fn loader(modules: &[&str]) -> PluginLoader {
        let mut registry = PluginRegistry::new();
        registry
            .register_default::<Stamp>("stamp")
            .register_default::<Broken>("broken");
        let modules = modules
            .iter()
            .map(|id| PluginModule::new(*id).with_primary())
            .collect();
        PluginLoader::new(registry, ModuleSet::from_modules(modules), LoadHooks::new())
    }

    async fn next<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    #[tokio::test]
    async fn test_worker_loads_and_dispatches() {
        let (ours, theirs) = link();
        let hub = ChannelHub::new(ours);
        let pipeline: PipelineChannel = hub.create_channel(PROXY_CHANNEL).unwrap();
        let notices: NoticeChannel = hub.create_channel(WORKER_CHANNEL).unwrap();

        let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();
        notices.subscribe(move |n| {
            let _ = notice_tx.send(n);
        });
        let (packet_tx, mut packet_rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.subscribe(move |m| {
            let _ = packet_tx.send(m);
        });

        let (worker, startup) = WorkerHandle::spawn(SessionId::next(), theirs, loader(&["stamp"]))
            .await
            .unwrap();
        assert!(startup > Duration::ZERO);

        match next(&mut notice_rx).await {
            WorkerNotice::Loaded { report } => {
                assert_eq!(report.activated, vec![ModuleId::new("stamp")]);
            }
            other => panic!("unexpected notice: {other:?}"),
        }

        pipeline
            .write(PipelineMessage::new(
                Direction::Upstream,
                RawPacket::new("chat", json!({}), None),
            ))
            .unwrap();
        let forwarded = next(&mut packet_rx).await;
        assert_eq!(forwarded.packet.data, json!({ "stamped": true }));

        assert_eq!(worker.stop().await, WorkerExit::Clean);
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let (ours, theirs) = link();
        let hub = ChannelHub::new(ours);
        let notices: NoticeChannel = hub.create_channel(WORKER_CHANNEL).unwrap();
        let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();
        notices.subscribe(move |n| {
            let _ = notice_tx.send(n);
        });

        let (worker, _) = WorkerHandle::spawn(SessionId::next(), theirs, loader(&["broken"]))
            .await
            .unwrap();

        match next(&mut notice_rx).await {
            WorkerNotice::LoadFailed { module, .. } => {
                assert_eq!(module, Some(ModuleId::new("broken")));
            }
            other => panic!("unexpected notice: {other:?}"),
        }

        let exit = wait_exit(worker.exit_watch()).await;
        assert!(matches!(exit, WorkerExit::Failed(_)));
        assert!(exit.is_abnormal());
    }

    #[test]
    fn test_notice_format() {
        let notice = WorkerNotice::LoadFailed {
            module: Some(ModuleId::new("a")),
            message: "x".into(),
            contract: false,
        };
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            value,
            json!({ "type": "load_failed", "module": "a", "message": "x", "contract": false })
        );
    }
}
