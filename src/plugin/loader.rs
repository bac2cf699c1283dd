//! Sequential plugin activation.
//!
//! The loader walks a [`ModuleSet`] in order and activates each module's
//! entry for one context:
//!
//! ```text
//! for module in modules (with an entry for this context):
//!     pre(id)
//!     plugin.activate(..)                          awaited
//!     for companion in ifpresent/ (installed only):
//!         pre(id/ifpresent/companion)
//!         plugin.activate_conditional(companion)   awaited
//!         post(id/ifpresent/companion, elapsed)
//!     post(id, elapsed)
//! ```
//!
//! # Error Policy
//!
//! A failure ends the current module's sequence. If an error hook is
//! installed it is called and loading continues with the next module;
//! otherwise loading aborts with the error.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{Error, PluginResult, Result};
use crate::identifiers::ModuleId;
use crate::session::{Session, WorkerScope};

use super::api::Plugin;
use super::discovery::{ConditionalEntry, ModuleSet, PluginModule};
use super::registry::PluginRegistry;

// ============================================================================
// Types
// ============================================================================

/// Called before an entry is activated.
pub type PreHook = Box<dyn Fn(&ModuleId) + Send + Sync>;

/// Called after an entry is activated, with its activation time.
pub type PostHook = Box<dyn Fn(&ModuleId, Duration) + Send + Sync>;

/// Called when an entry fails. Its presence makes failures non-fatal.
pub type ErrorHook = Box<dyn Fn(&Error, &ModuleId) + Send + Sync>;

// ============================================================================
// LoadContext
// ============================================================================

/// Which entries a load pass activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadContext {
    /// Primary entries, inside the session worker.
    Primary,
    /// Secondary entries, in the orchestrator.
    Secondary,
}

impl LoadContext {
    /// Returns a short label for logs.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    fn has_entry(self, module: &PluginModule) -> bool {
        match self {
            Self::Primary => module.has_primary(),
            Self::Secondary => module.has_secondary(),
        }
    }

    fn has_conditional(self, entry: &ConditionalEntry) -> bool {
        match self {
            Self::Primary => entry.primary,
            Self::Secondary => entry.secondary,
        }
    }
}

impl fmt::Display for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an activation runs.
#[derive(Clone, Copy)]
enum Target<'a> {
    Worker(&'a WorkerScope),
    Orchestrator(&'a Session),
}

impl Target<'_> {
    fn context(&self) -> LoadContext {
        match self {
            Self::Worker(_) => LoadContext::Primary,
            Self::Orchestrator(_) => LoadContext::Secondary,
        }
    }
}

// ============================================================================
// LoadHooks
// ============================================================================

/// Observability hooks around each activation.
#[derive(Default)]
pub struct LoadHooks {
    pre: Option<PreHook>,
    post: Option<PostHook>,
    error: Option<ErrorHook>,
}

impl fmt::Debug for LoadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHooks")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl LoadHooks {
    /// Creates hooks with nothing installed: failures abort loading.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks that log every step and continue past failures.
    #[must_use]
    pub fn logging() -> Self {
        Self::new()
            .on_pre(|id| debug!(module = %id, "Loading module"))
            .on_post(|id, elapsed| {
                info!(module = %id, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "Module loaded");
            })
            .on_error(|err, id| error!(module = %id, error = %err, "Module failed to load"))
    }

    /// Sets the pre-activation hook.
    #[must_use]
    pub fn on_pre<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModuleId) + Send + Sync + 'static,
    {
        self.pre = Some(Box::new(hook));
        self
    }

    /// Sets the post-activation hook.
    #[must_use]
    pub fn on_post<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModuleId, Duration) + Send + Sync + 'static,
    {
        self.post = Some(Box::new(hook));
        self
    }

    /// Sets the error hook, making failures non-fatal.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error, &ModuleId) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(hook));
        self
    }

    /// Returns `true` if failures continue loading.
    #[inline]
    #[must_use]
    pub fn continues_on_error(&self) -> bool {
        self.error.is_some()
    }

    fn pre(&self, id: &ModuleId) {
        if let Some(hook) = &self.pre {
            hook(id);
        }
    }

    fn post(&self, id: &ModuleId, elapsed: Duration) {
        if let Some(hook) = &self.post {
            hook(id, elapsed);
        }
    }
}

// ============================================================================
// LoadReport
// ============================================================================

/// Result of one load pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Context that was loaded.
    pub context: LoadContext,
    /// Modules whose entry activated, in order.
    pub activated: Vec<ModuleId>,
    /// Conditional entries that activated, as `module/ifpresent/companion`.
    pub conditionals: Vec<ModuleId>,
    /// Entries that failed, with their error message.
    pub failures: Vec<(ModuleId, String)>,
    /// Total time of the pass.
    pub elapsed: Duration,
}

impl LoadReport {
    fn new(context: LoadContext) -> Self {
        Self {
            context,
            activated: Vec::new(),
            conditionals: Vec::new(),
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Returns `true` if every entry activated.
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// PluginLoader
// ============================================================================

/// Activates plugin entries for a session.
///
/// Cheap to clone; the worker and the orchestrator each hold one.
#[derive(Clone)]
pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    modules: Arc<ModuleSet>,
    hooks: Arc<LoadHooks>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("modules", &self.modules.len())
            .field("registered", &self.registry.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl PluginLoader {
    /// Creates a loader.
    #[must_use]
    pub fn new(registry: PluginRegistry, modules: ModuleSet, hooks: LoadHooks) -> Self {
        Self {
            registry: Arc::new(registry),
            modules: Arc::new(modules),
            hooks: Arc::new(hooks),
        }
    }

    /// Returns the modules in load order.
    #[inline]
    #[must_use]
    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    /// Returns the plugin registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Activates primary entries inside the session worker.
    ///
    /// # Errors
    ///
    /// Returns the first failure when no error hook is installed.
    pub async fn load_primary(&self, scope: &WorkerScope) -> Result<LoadReport> {
        self.load(Target::Worker(scope)).await
    }

    /// Activates secondary entries in the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns the first failure when no error hook is installed.
    pub async fn load_secondary(&self, session: &Session) -> Result<LoadReport> {
        self.load(Target::Orchestrator(session)).await
    }

    async fn load(&self, target: Target<'_>) -> Result<LoadReport> {
        let context = target.context();
        let start = Instant::now();
        let mut report = LoadReport::new(context);

        debug!(%context, modules = self.modules.len(), "Loading modules");

        for module in self.modules.modules() {
            if !context.has_entry(module) {
                continue;
            }

            if let Err((id, err)) = self.load_module(module, target, &mut report).await {
                match &self.hooks.error {
                    Some(hook) => {
                        hook(&err, &id);
                        report.failures.push((id, err.to_string()));
                    }
                    None => return Err(err),
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            %context,
            activated = report.activated.len(),
            conditionals = report.conditionals.len(),
            failed = report.failures.len(),
            elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
            "Modules loaded"
        );

        Ok(report)
    }

    /// Activates one module and its conditional entries.
    ///
    /// On failure returns the id of the entry that failed.
    async fn load_module(
        &self,
        module: &PluginModule,
        target: Target<'_>,
        report: &mut LoadReport,
    ) -> StdResult<(), (ModuleId, Error)> {
        let id = module.id();
        let start = Instant::now();
        self.hooks.pre(id);

        let plugin = self.registry.instantiate(id).ok_or_else(|| {
            (
                id.clone(),
                Error::plugin_contract(id, "no plugin registered for module"),
            )
        })?;

        activate(plugin.as_ref(), target, None)
            .await
            .map_err(|e| (id.clone(), Error::plugin_activation(id, e.to_string())))?;
        report.activated.push(id.clone());

        let context = target.context();
        for entry in module.conditionals() {
            if !context.has_conditional(entry) {
                continue;
            }
            if !self.modules.is_installed(&entry.companion) {
                debug!(module = %id, companion = %entry.companion, "Companion absent, skipping");
                continue;
            }

            let entry_id = conditional_id(id, &entry.companion);
            let entry_start = Instant::now();
            self.hooks.pre(&entry_id);

            activate(plugin.as_ref(), target, Some(&entry.companion))
                .await
                .map_err(|e| {
                    let err = Error::plugin_activation(&entry_id, e.to_string());
                    (entry_id.clone(), err)
                })?;

            self.hooks.post(&entry_id, entry_start.elapsed());
            report.conditionals.push(entry_id);
        }

        self.hooks.post(id, start.elapsed());
        Ok(())
    }
}

/// Runs one entry of a plugin.
async fn activate(
    plugin: &dyn Plugin,
    target: Target<'_>,
    companion: Option<&ModuleId>,
) -> PluginResult {
    match (target, companion) {
        (Target::Worker(scope), None) => plugin.activate(scope).await,
        (Target::Worker(scope), Some(companion)) => {
            plugin.activate_conditional(companion, scope).await
        }
        (Target::Orchestrator(session), None) => plugin.activate_local(session).await,
        (Target::Orchestrator(session), Some(companion)) => {
            plugin.activate_conditional_local(companion, session).await
        }
    }
}

/// Identity of a conditional entry.
#[must_use]
pub fn conditional_id(module: &ModuleId, companion: &ModuleId) -> ModuleId {
    ModuleId::new(format!("{module}/ifpresent/{companion}"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use futures_util::FutureExt;
    use parking_lot::Mutex;

    use crate::identifiers::SessionId;
    use crate::pipeline::Proxy;
    use crate::protocol::PROXY_CHANNEL;
    use crate::transport::{ChannelHub, link};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        async fn activate(&self, scope: &WorkerScope) -> PluginResult {
            tokio::task::yield_now().await;
            self.log.lock().push(format!("activate:{}", self.name));
            if self.fail {
                return Err("boom".into());
            }
            let tag = self.name;
            scope.proxy().upstream().on_packet(move |packet| {
                async move {
                    packet.set("last", tag);
                    Ok(())
                }
                .boxed()
            });
            Ok(())
        }

        async fn activate_conditional(
            &self,
            companion: &ModuleId,
            scope: &WorkerScope,
        ) -> PluginResult {
            self.log
                .lock()
                .push(format!("conditional:{}:{companion}", self.name));
            scope.proxy().upstream().on("chat", |packet| {
                async move {
                    packet.set("decorated", true);
                    Ok(())
                }
                .boxed()
            });
            Ok(())
        }
    }

    fn scope() -> (WorkerScope, ChannelHub) {
        let (worker_end, orchestrator_end) = link();
        let hub = ChannelHub::new(worker_end);
        let channel = hub.create_channel(PROXY_CHANNEL).unwrap();
        let scope = WorkerScope::new(SessionId::next(), hub, Proxy::new(channel));
        (scope, ChannelHub::new(orchestrator_end))
    }

    fn registry(log: &Log, failing: &[&'static str]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for name in ["a", "b", "c", "cosmetics", "chat-filter"] {
            let log = Arc::clone(log);
            let fail = failing.contains(&name);
            registry.register(name, move || {
                Box::new(Recorder {
                    name,
                    log: Arc::clone(&log),
                    fail,
                })
            });
        }
        registry
    }

    fn hooks_into(log: &Log) -> LoadHooks {
        let pre_log = Arc::clone(log);
        let post_log = Arc::clone(log);
        LoadHooks::new()
            .on_pre(move |id| pre_log.lock().push(format!("pre:{id}")))
            .on_post(move |id, _| post_log.lock().push(format!("post:{id}")))
    }

    #[tokio::test]
    async fn test_sequential_order_with_hooks() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("a").with_primary(),
            PluginModule::new("b").with_primary(),
        ]);
        let loader = PluginLoader::new(registry(&log, &[]), modules, hooks_into(&log));
        let (scope, _peer) = scope();

        let report = loader.load_primary(&scope).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["pre:a", "activate:a", "post:a", "pre:b", "activate:b", "post:b"]
        );
        assert_eq!(report.activated, vec![ModuleId::new("a"), ModuleId::new("b")]);
        assert!(report.is_clean());
        assert_eq!(report.context, LoadContext::Primary);
    }

    #[tokio::test]
    async fn test_modules_without_entry_are_skipped() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("a").with_secondary(),
            PluginModule::new("b").with_primary(),
        ]);
        let loader = PluginLoader::new(registry(&log, &[]), modules, LoadHooks::new());
        let (scope, _peer) = scope();

        let report = loader.load_primary(&scope).await.unwrap();
        assert_eq!(report.activated, vec![ModuleId::new("b")]);
    }

    #[tokio::test]
    async fn test_conditional_runs_after_primary_when_companion_installed() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("chat-filter").with_primary(),
            PluginModule::new("cosmetics")
                .with_primary()
                .with_conditional("chat-filter"),
        ]);
        let loader = PluginLoader::new(registry(&log, &[]), modules, hooks_into(&log));
        let (scope, _peer) = scope();

        let report = loader.load_primary(&scope).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "pre:chat-filter",
                "activate:chat-filter",
                "post:chat-filter",
                "pre:cosmetics",
                "activate:cosmetics",
                "pre:cosmetics/ifpresent/chat-filter",
                "conditional:cosmetics:chat-filter",
                "post:cosmetics/ifpresent/chat-filter",
                "post:cosmetics",
            ]
        );
        assert_eq!(
            report.conditionals,
            vec![ModuleId::new("cosmetics/ifpresent/chat-filter")]
        );
        assert_eq!(scope.proxy().upstream().bus().named_count("chat"), 1);
    }

    #[tokio::test]
    async fn test_conditional_skipped_when_companion_absent() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("cosmetics")
                .with_primary()
                .with_conditional("chat-filter"),
        ]);
        let loader = PluginLoader::new(registry(&log, &[]), modules, LoadHooks::new());
        let (scope, _peer) = scope();

        let report = loader.load_primary(&scope).await.unwrap();

        assert!(report.conditionals.is_empty());
        assert_eq!(*log.lock(), vec!["activate:cosmetics"]);
        assert_eq!(scope.proxy().upstream().bus().named_count("chat"), 0);
        assert_eq!(scope.proxy().upstream().bus().generic_count(), 1);
    }

    #[tokio::test]
    async fn test_error_hook_continues_loading() {
        let log = Log::default();
        let errors = Log::default();
        let error_log = Arc::clone(&errors);
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("a").with_primary(),
            PluginModule::new("b").with_primary(),
            PluginModule::new("c").with_primary(),
        ]);
        let hooks = LoadHooks::new().on_error(move |err, id| {
            assert!(err.is_plugin_error());
            error_log.lock().push(id.to_string());
        });
        let loader = PluginLoader::new(registry(&log, &["b"]), modules, hooks);
        let (scope, _peer) = scope();

        let report = loader.load_primary(&scope).await.unwrap();

        assert_eq!(report.activated, vec![ModuleId::new("a"), ModuleId::new("c")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, ModuleId::new("b"));
        assert_eq!(*errors.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_failure_aborts_without_error_hook() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("a").with_primary(),
            PluginModule::new("b").with_primary(),
            PluginModule::new("c").with_primary(),
        ]);
        let loader = PluginLoader::new(registry(&log, &["b"]), modules, LoadHooks::new());
        let (scope, _peer) = scope();

        let err = loader.load_primary(&scope).await.unwrap_err();

        assert!(matches!(err, Error::PluginActivation { .. }));
        assert_eq!(err.module().map(ModuleId::as_str), Some("b"));
        assert_eq!(*log.lock(), vec!["activate:a", "activate:b"]);
    }

    #[tokio::test]
    async fn test_unregistered_module_is_contract_violation() {
        let modules = ModuleSet::from_modules(vec![PluginModule::new("ghost").with_primary()]);
        let loader = PluginLoader::new(PluginRegistry::new(), modules, LoadHooks::new());
        let (scope, _peer) = scope();

        let err = loader.load_primary(&scope).await.unwrap_err();
        assert!(matches!(err, Error::PluginContract { .. }));
        assert_eq!(err.module().map(ModuleId::as_str), Some("ghost"));
    }

    #[tokio::test]
    async fn test_registration_follows_module_order() {
        let log = Log::default();
        let modules = ModuleSet::from_modules(vec![
            PluginModule::new("a").with_primary(),
            PluginModule::new("b").with_primary(),
        ]);
        let loader = PluginLoader::new(registry(&log, &[]), modules, LoadHooks::new());
        let (scope, _peer) = scope();
        loader.load_primary(&scope).await.unwrap();

        let mut packet = crate::protocol::Packet::new("chat", serde_json::json!({}), None);
        scope.proxy().upstream().bus().emit(&mut packet).await.unwrap();
        assert_eq!(packet.get("last"), Some(&serde_json::json!("b")));
    }

    #[test]
    fn test_conditional_id_format() {
        let id = conditional_id(&ModuleId::new("cosmetics"), &ModuleId::new("chat-filter"));
        assert_eq!(id.as_str(), "cosmetics/ifpresent/chat-filter");
    }

    #[test]
    fn test_logging_hooks_continue() {
        assert!(LoadHooks::logging().continues_on_error());
        assert!(!LoadHooks::new().continues_on_error());
    }
}
