//! Plugin module discovery.
//!
//! A modules root holds one directory per module. Entry files mark which
//! contexts the module participates in:
//!
//! ```text
//! modules/
//! ├── chat-filter/
//! │   ├── local.entry          primary entry (session worker)
//! │   └── m3.global.json       optional manifest
//! └── cosmetics/
//!     ├── local.entry
//!     ├── global.entry         secondary entry (orchestrator)
//!     └── ifpresent/
//!         └── chat-filter/
//!             └── local.entry  activated only if chat-filter is installed
//! ```
//!
//! Entry files are markers; their contents are ignored. The behavior behind
//! each entry comes from the [`PluginRegistry`](super::PluginRegistry).
//!
//! Modules are ordered by directory name so the load order is reproducible
//! for a given filesystem state.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::ModuleId;

// ============================================================================
// Constants
// ============================================================================

/// Default primary entry file name.
pub const DEFAULT_PRIMARY_ENTRY: &str = "local.entry";

/// Default secondary entry file name.
pub const DEFAULT_SECONDARY_ENTRY: &str = "global.entry";

/// Directory holding conditional entries.
pub const CONDITIONAL_DIR: &str = "ifpresent";

/// Global manifest file name.
pub const GLOBAL_MANIFEST: &str = "m3.global.json";

/// Local manifest file name.
pub const LOCAL_MANIFEST: &str = "m3.local.json";

// ============================================================================
// ModuleLayout
// ============================================================================

/// Entry file names looked up in each module directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleLayout {
    /// File marking the primary entry.
    pub primary_entry: String,
    /// File marking the secondary entry.
    pub secondary_entry: String,
}

impl Default for ModuleLayout {
    fn default() -> Self {
        Self {
            primary_entry: DEFAULT_PRIMARY_ENTRY.to_string(),
            secondary_entry: DEFAULT_SECONDARY_ENTRY.to_string(),
        }
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// Global manifest (`m3.global.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalManifest {
    /// Published module name.
    pub name: String,
    /// Names of modules this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Local manifest (`m3.local.json`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalManifest {
    /// `true` if the module was installed by hand rather than resolved.
    #[serde(default)]
    pub manual: bool,
}

// ============================================================================
// ConditionalEntry
// ============================================================================

/// An `ifpresent/<companion>` entry of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalEntry {
    /// Module whose presence enables this entry.
    pub companion: ModuleId,
    /// Activated in the session worker.
    pub primary: bool,
    /// Activated in the orchestrator.
    pub secondary: bool,
}

// ============================================================================
// PluginModule
// ============================================================================

/// A discovered (or configured) plugin module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginModule {
    id: ModuleId,
    path: Option<PathBuf>,
    primary: bool,
    secondary: bool,
    conditionals: Vec<ConditionalEntry>,
    manifest: Option<GlobalManifest>,
    local_manifest: Option<LocalManifest>,
}

impl PluginModule {
    /// Creates a module with no entries.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<ModuleId>) -> Self {
        Self {
            id: id.into(),
            path: None,
            primary: false,
            secondary: false,
            conditionals: Vec::new(),
            manifest: None,
            local_manifest: None,
        }
    }

    /// Enables the primary entry.
    #[inline]
    #[must_use]
    pub fn with_primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Enables the secondary entry.
    #[inline]
    #[must_use]
    pub fn with_secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    /// Adds a primary conditional entry for `companion`.
    #[must_use]
    pub fn with_conditional(mut self, companion: impl Into<ModuleId>) -> Self {
        self.add_conditional(companion.into(), true, false);
        self
    }

    /// Adds a secondary conditional entry for `companion`.
    #[must_use]
    pub fn with_conditional_local(mut self, companion: impl Into<ModuleId>) -> Self {
        self.add_conditional(companion.into(), false, true);
        self
    }

    fn add_conditional(&mut self, companion: ModuleId, primary: bool, secondary: bool) {
        if let Some(entry) = self
            .conditionals
            .iter_mut()
            .find(|entry| entry.companion == companion)
        {
            entry.primary |= primary;
            entry.secondary |= secondary;
            return;
        }

        self.conditionals.push(ConditionalEntry {
            companion,
            primary,
            secondary,
        });
        self.conditionals
            .sort_by(|a, b| a.companion.cmp(&b.companion));
    }

    /// Returns the module identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Returns the module directory, if discovered from disk.
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns `true` if the module has a primary entry.
    #[inline]
    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.primary
    }

    /// Returns `true` if the module has a secondary entry.
    #[inline]
    #[must_use]
    pub fn has_secondary(&self) -> bool {
        self.secondary
    }

    /// Returns the conditional entries, ordered by companion.
    #[inline]
    #[must_use]
    pub fn conditionals(&self) -> &[ConditionalEntry] {
        &self.conditionals
    }

    /// Returns the global manifest, if present.
    #[inline]
    #[must_use]
    pub fn manifest(&self) -> Option<&GlobalManifest> {
        self.manifest.as_ref()
    }

    /// Returns the local manifest, if present.
    #[inline]
    #[must_use]
    pub fn local_manifest(&self) -> Option<LocalManifest> {
        self.local_manifest
    }

    /// Returns the published name, falling back to the identity.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.manifest
            .as_ref()
            .map_or(self.id.as_str(), |manifest| manifest.name.as_str())
    }

    /// Reads one module directory.
    fn load(dir: &Path, id: ModuleId, layout: &ModuleLayout) -> Result<Self> {
        let mut module = Self::new(id);
        module.primary = dir.join(&layout.primary_entry).is_file();
        module.secondary = dir.join(&layout.secondary_entry).is_file();
        module.manifest = read_manifest(&module.id, &dir.join(GLOBAL_MANIFEST))?;
        module.local_manifest = read_manifest(&module.id, &dir.join(LOCAL_MANIFEST))?;

        let conditional_root = dir.join(CONDITIONAL_DIR);
        if conditional_root.is_dir() {
            for (companion, path) in sorted_dirs(&conditional_root)? {
                let primary = path.join(&layout.primary_entry).is_file();
                let secondary = path.join(&layout.secondary_entry).is_file();
                if primary || secondary {
                    module.add_conditional(companion, primary, secondary);
                }
            }
        }

        module.path = Some(dir.to_path_buf());
        Ok(module)
    }
}

// ============================================================================
// ModuleSet
// ============================================================================

/// Ordered modules plus the set of installed identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    modules: Vec<PluginModule>,
    installed: FxHashSet<ModuleId>,
}

impl ModuleSet {
    /// Builds a set from an explicit list, keeping its order.
    ///
    /// Every listed module counts as installed.
    #[must_use]
    pub fn from_modules(modules: Vec<PluginModule>) -> Self {
        let installed = modules.iter().map(|m| m.id.clone()).collect();
        Self { modules, installed }
    }

    /// Discovers modules under `root`.
    ///
    /// A missing root yields an empty set.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the root cannot be listed
    /// - [`Error::PluginContract`] if a manifest is malformed
    pub fn discover(root: impl AsRef<Path>, layout: &ModuleLayout) -> Result<Self> {
        let root = root.as_ref();

        if !root.is_dir() {
            warn!(root = %root.display(), "Modules directory not found, no plugins loaded");
            return Ok(Self::default());
        }

        let mut modules = Vec::new();
        let mut installed = FxHashSet::default();

        for (id, path) in sorted_dirs(root)? {
            installed.insert(id.clone());
            let module = PluginModule::load(&path, id, layout)?;
            debug!(
                module = %module.id,
                primary = module.primary,
                secondary = module.secondary,
                conditionals = module.conditionals.len(),
                "Discovered module"
            );
            modules.push(module);
        }

        Ok(Self { modules, installed })
    }

    /// Marks an extra identity as installed.
    #[must_use]
    pub fn with_installed(mut self, id: impl Into<ModuleId>) -> Self {
        self.installed.insert(id.into());
        self
    }

    /// Returns the modules in load order.
    #[inline]
    #[must_use]
    pub fn modules(&self) -> &[PluginModule] {
        &self.modules
    }

    /// Returns `true` if a module is installed.
    #[inline]
    #[must_use]
    pub fn is_installed(&self, id: &ModuleId) -> bool {
        self.installed.contains(id)
    }

    /// Returns the number of modules.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if there are no modules.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Convenience for [`ModuleSet::discover`].
///
/// # Errors
///
/// See [`ModuleSet::discover`].
pub fn discover_modules(root: impl AsRef<Path>, layout: &ModuleLayout) -> Result<ModuleSet> {
    ModuleSet::discover(root, layout)
}

// ============================================================================
// Helpers
// ============================================================================

/// Lists subdirectories sorted by name.
fn sorted_dirs(dir: &Path) -> Result<Vec<(ModuleId, PathBuf)>> {
    let mut dirs = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(ModuleId::from) else {
            warn!(path = %entry.path().display(), "Skipping non UTF-8 module directory");
            continue;
        };
        dirs.push((name, entry.path()));
    }

    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirs)
}

/// Parses an optional JSON manifest.
fn read_manifest<T: DeserializeOwned>(module: &ModuleId, path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }

    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map(Some).map_err(|e| {
        Error::plugin_contract(
            module,
            format!("invalid manifest {}: {e}", path.display()),
        )
    })
}

// ============================================================================
// Tests
// ============================================================================
