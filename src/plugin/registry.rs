//! Plugin registry.
//!
//! Maps module identities to factories. Every session instantiates its own
//! plugins, once per context, so no plugin state is shared across sessions.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::identifiers::ModuleId;

use super::api::Plugin;

// ============================================================================
// Types
// ============================================================================

/// Creates a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

// ============================================================================
// PluginRegistry
// ============================================================================

/// Statically linked plugin implementations, keyed by module identity.
///
/// # Example
///
/// ```ignore
/// let mut registry = PluginRegistry::new();
/// registry
///     .register_default::<ChatFilter>("chat-filter")
///     .register("cosmetics", || Box::new(Cosmetics::new("gold")));
/// ```
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: FxHashMap<ModuleId, PluginFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modules", &self.ids())
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a module, replacing any previous one.
    pub fn register<F>(&mut self, id: impl Into<ModuleId>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    /// Registers a plugin type built with [`Default`].
    pub fn register_default<P>(&mut self, id: impl Into<ModuleId>) -> &mut Self
    where
        P: Plugin + Default + 'static,
    {
        self.register(id, || Box::new(P::default()))
    }

    /// Creates a new instance of a module's plugin.
    #[must_use]
    pub fn instantiate(&self, id: &ModuleId) -> Option<Box<dyn Plugin>> {
        self.factories.get(id).map(|factory| factory())
    }

    /// Returns `true` if a module is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.factories.contains_key(id)
    }

    /// Returns the registered module ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of registered modules.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Noop;

    impl Plugin for Noop {}

    #[test]
    fn test_register_and_instantiate() {
        let mut registry = PluginRegistry::new();
        registry.register_default::<Noop>("noop");

        assert!(registry.contains(&ModuleId::new("noop")));
        assert!(registry.instantiate(&ModuleId::new("noop")).is_some());
        assert!(registry.instantiate(&ModuleId::new("missing")).is_none());
    }

    #[test]
    fn test_each_instantiation_is_fresh() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);

        let mut registry = PluginRegistry::new();
        registry.register("counted", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Noop)
        });

        let id = ModuleId::new("counted");
        let _a = registry.instantiate(&id);
        let _b = registry.instantiate(&id);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ids_sorted() {
        let mut registry = PluginRegistry::new();
        registry
            .register_default::<Noop>("zeta")
            .register_default::<Noop>("alpha");

        assert_eq!(
            registry.ids(),
            vec![ModuleId::new("alpha"), ModuleId::new("zeta")]
        );
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
    }
}
