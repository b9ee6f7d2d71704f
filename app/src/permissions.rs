//! Module account permissions
//!
//! The table is built once at startup and shared read-only with the supply
//! keeper, which enforces it on every mint, burn and pool transfer.

use chain_modules::{
    auth::FEE_COLLECTOR,
    distribution, evm, mint,
    staking::{BONDED_POOL, NOT_BONDED_POOL},
    Address, Permission, PermissionTable,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Module accounts that may still receive user transfers
pub const ALLOWED_RECEIVERS: &[&str] = &[distribution::MODULE_NAME];

/// Immutable module permission table
#[derive(Debug, Clone)]
pub struct Permissions {
    table: Arc<PermissionTable>,
}

impl Permissions {
    /// Table used by the application
    pub fn standard() -> Self {
        Self::new(PermissionTable::new([
            (FEE_COLLECTOR, vec![]),
            (distribution::MODULE_NAME, vec![]),
            (mint::MODULE_NAME, vec![Permission::Minter]),
            (BONDED_POOL, vec![Permission::Burner, Permission::Staking]),
            (NOT_BONDED_POOL, vec![Permission::Burner, Permission::Staking]),
            (evm::MODULE_NAME, vec![Permission::Minter, Permission::Burner]),
        ]))
    }

    /// Wrap a custom table
    pub fn new(table: PermissionTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    /// Shared table handed to the supply keeper
    pub fn table(&self) -> Arc<PermissionTable> {
        Arc::clone(&self.table)
    }

    /// True if `module` holds `permission`
    pub fn has(&self, module: &str, permission: Permission) -> bool {
        self.table.has(module, permission)
    }

    /// Module account address of every entry
    pub fn module_addresses(&self) -> BTreeMap<String, Address> {
        self.table.module_addresses()
    }

    /// Module addresses refused as transfer destinations
    pub fn blocked_receivers(&self) -> BTreeSet<Address> {
        self.table
            .module_addresses()
            .into_iter()
            .filter(|(name, _)| !ALLOWED_RECEIVERS.contains(&name.as_str()))
            .map(|(_, address)| address)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_capabilities() {
        let perms = Permissions::standard();
        assert!(perms.has(mint::MODULE_NAME, Permission::Minter));
        assert!(!perms.has(mint::MODULE_NAME, Permission::Burner));
        assert!(perms.has(BONDED_POOL, Permission::Staking));
        assert!(!perms.has(FEE_COLLECTOR, Permission::Minter));
        assert!(!perms.has("unknown", Permission::Minter));
        assert_eq!(perms.module_addresses().len(), 6);
    }

    #[test]
    fn test_blocked_receivers_exclude_distribution() {
        let perms = Permissions::standard();
        let blocked = perms.blocked_receivers();
        assert_eq!(blocked.len(), 5);
        assert!(!blocked.contains(&Address::for_module(distribution::MODULE_NAME)));
        assert!(blocked.contains(&Address::for_module(FEE_COLLECTOR)));
        assert!(blocked.contains(&Address::for_module(BONDED_POOL)));
    }
}
