//! Partition allocation
//!
//! All partitions are allocated in one call at startup. Allocation is the
//! only constructor of [`StoreKey`], so a partition cannot be created later
//! and two modules cannot end up sharing one.

use crate::{
    types::{StoreKey, StoreKind},
    Error, Result,
};
use std::collections::{BTreeMap, BTreeSet};

/// Allocated partition handles, by name
#[derive(Debug, Clone, Default)]
pub struct StoreKeys {
    persistent: BTreeMap<String, StoreKey>,
    transient: BTreeMap<String, StoreKey>,
}

impl StoreKeys {
    /// Persistent partition by name
    pub fn persistent(&self, name: &str) -> Result<StoreKey> {
        self.persistent
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStore(name.to_string()))
    }

    /// Transient partition by name
    pub fn transient(&self, name: &str) -> Result<StoreKey> {
        self.transient
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStore(name.to_string()))
    }

    /// Every allocated key, persistent first
    pub fn all(&self) -> impl Iterator<Item = &StoreKey> {
        self.persistent.values().chain(self.transient.values())
    }

    /// Persistent keys only, ordered by name
    pub fn persistent_keys(&self) -> impl Iterator<Item = &StoreKey> {
        self.persistent.values()
    }
}

/// Allocates partitions once, from the union of every module's needs
#[derive(Debug, Default)]
pub struct StoreRegistry;

impl StoreRegistry {
    /// Allocate persistent and transient partitions
    ///
    /// Fails if any name is requested twice, within or across the two sets.
    pub fn allocate<'a>(
        persistent: impl IntoIterator<Item = &'a str>,
        transient: impl IntoIterator<Item = &'a str>,
    ) -> Result<StoreKeys> {
        let mut seen = BTreeSet::new();
        let mut keys = StoreKeys::default();

        for name in persistent {
            if !seen.insert(name) {
                return Err(Error::DuplicateStoreKey(name.to_string()));
            }
            keys.persistent
                .insert(name.to_string(), StoreKey::new(name, StoreKind::Persistent));
        }

        for name in transient {
            if !seen.insert(name) {
                return Err(Error::DuplicateStoreKey(name.to_string()));
            }
            keys.transient
                .insert(name.to_string(), StoreKey::new(name, StoreKind::Transient));
        }

        tracing::debug!(
            persistent = keys.persistent.len(),
            transient = keys.transient.len(),
            "Allocated store partitions"
        );

        Ok(keys)
    }
}
