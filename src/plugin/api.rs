//! Plugin entry contract.
//!
//! A plugin module has up to two entries, plus optional conditional entries:
//!
//! | Entry | Runs in | Method |
//! |-------|---------|--------|
//! | primary | session worker | [`Plugin::activate`] |
//! | secondary | orchestrator | [`Plugin::activate_local`] |
//! | `ifpresent/<companion>` primary | session worker | [`Plugin::activate_conditional`] |
//! | `ifpresent/<companion>` secondary | orchestrator | [`Plugin::activate_conditional_local`] |
//!
//! Each entry is activated exactly once per session. The loader awaits every
//! activation before moving on, so handler registration order follows module
//! order.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::PluginResult;
use crate::identifiers::ModuleId;
use crate::session::{Session, WorkerScope};

// ============================================================================
// Plugin
// ============================================================================

/// Capability interface implemented by every plugin module.
///
/// All methods default to doing nothing, so a plugin only implements the
/// entries it ships.
///
/// # Example
///
/// ```ignore
/// use futures_util::FutureExt;
///
/// #[derive(Default)]
/// struct ChatFilter;
///
/// #[async_trait]
/// impl Plugin for ChatFilter {
///     async fn activate(&self, scope: &WorkerScope) -> PluginResult {
///         scope.proxy().upstream().on("chat", |packet| {
///             async move {
///                 packet.cancel();
///                 Ok(())
///             }
///             .boxed()
///         });
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Activates the primary entry inside the session worker.
    async fn activate(&self, scope: &WorkerScope) -> PluginResult {
        let _ = scope;
        Ok(())
    }

    /// Activates the secondary entry in the orchestrator.
    async fn activate_local(&self, session: &Session) -> PluginResult {
        let _ = session;
        Ok(())
    }

    /// Activates the primary conditional entry for an installed companion.
    async fn activate_conditional(&self, companion: &ModuleId, scope: &WorkerScope) -> PluginResult {
        let _ = (companion, scope);
        Ok(())
    }

    /// Activates the secondary conditional entry for an installed companion.
    async fn activate_conditional_local(
        &self,
        companion: &ModuleId,
        session: &Session,
    ) -> PluginResult {
        let _ = (companion, session);
        Ok(())
    }
}
