//! Bundled plugins.
//!
//! | Module id | Plugin | Entries |
//! |-----------|--------|---------|
//! | `packet-log` | [`PacketLog`] | primary, secondary |
//!
//! Install a bundled plugin by creating its module directory under the
//! modules root with the entry files it ships.

// ============================================================================
// Submodules
// ============================================================================

/// Packet logger.
pub mod packet_log;

// ============================================================================
// Re-exports
// ============================================================================

pub use packet_log::{PACKET_LOG, PacketLog};

use crate::plugin::PluginRegistry;

/// Registers every bundled plugin.
pub fn register_bundled(registry: &mut PluginRegistry) -> &mut PluginRegistry {
    registry.register_default::<PacketLog>(PACKET_LOG)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifiers::ModuleId;

    #[test]
    fn test_register_bundled() {
        let mut registry = PluginRegistry::new();
        register_bundled(&mut registry);
        assert!(registry.contains(&ModuleId::new(PACKET_LOG)));
    }
}
