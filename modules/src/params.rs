//! Parameter subspaces
//!
//! All module parameters live in the single `params` partition, namespaced
//! by subspace name. Writes also mark the parameter as modified in the
//! `transient_params` partition for the rest of the block.
//!
//! Subspaces are created during wiring only; [`ParamsKeeper::seal`] closes
//! the registry.

use crate::{Error, Result};
use chain_store::{Context, StoreKey};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;

/// Module name
pub const MODULE_NAME: &str = "params";

/// Store key name
pub const STORE_KEY: &str = "params";

/// Transient store key name
pub const TSTORE_KEY: &str = "transient_params";

const MODIFIED: &[u8] = &[1];

/// Subspace registry
#[derive(Debug, Clone)]
pub struct ParamsKeeper {
    key: StoreKey,
    tkey: StoreKey,
    spaces: BTreeSet<String>,
    sealed: bool,
}

impl ParamsKeeper {
    /// Create keeper over the params partitions
    pub fn new(key: StoreKey, tkey: StoreKey) -> Self {
        Self {
            key,
            tkey,
            spaces: BTreeSet::new(),
            sealed: false,
        }
    }

    /// Allocate a subspace; each name may be taken once
    pub fn subspace(&mut self, name: &str) -> Result<Subspace> {
        if self.sealed {
            return Err(Error::ParamsSealed(name.to_string()));
        }
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidRequest(format!("invalid subspace name: {:?}", name)));
        }
        if !self.spaces.insert(name.to_string()) {
            return Err(Error::DuplicateSubspace(name.to_string()));
        }

        tracing::debug!(subspace = name, "Allocated parameter subspace");

        Ok(Subspace {
            name: name.to_string(),
            key: self.key.clone(),
            tkey: self.tkey.clone(),
        })
    }

    /// Refuse further subspaces
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Allocated subspace names
    pub fn subspaces(&self) -> impl Iterator<Item = &str> {
        self.spaces.iter().map(String::as_str)
    }
}

/// One module's parameter namespace
#[derive(Debug, Clone)]
pub struct Subspace {
    name: String,
    key: StoreKey,
    tkey: StoreKey,
}

impl Subspace {
    /// Subspace name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn full_key(&self, param: &str) -> Vec<u8> {
        format!("{}/{}", self.name, param).into_bytes()
    }

    /// Read a parameter
    pub fn get<T: DeserializeOwned>(&self, ctx: &mut Context<'_>, param: &str) -> Result<Option<T>> {
        match ctx.get(&self.key, &self.full_key(param))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a parameter, falling back to `T::default()`
    pub fn get_or_default<T: DeserializeOwned + Default>(
        &self,
        ctx: &mut Context<'_>,
        param: &str,
    ) -> Result<T> {
        Ok(self.get(ctx, param)?.unwrap_or_default())
    }

    /// Write a parameter and mark it modified for this block
    pub fn set<T: Serialize>(&self, ctx: &mut Context<'_>, param: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let full_key = self.full_key(param);
        ctx.set(&self.key, &full_key, bytes)?;
        ctx.set(&self.tkey, &full_key, MODIFIED.to_vec())?;
        Ok(())
    }

    /// True if the parameter was written in the current block
    pub fn modified(&self, ctx: &mut Context<'_>, param: &str) -> Result<bool> {
        Ok(ctx.has(&self.tkey, &self.full_key(param))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestEnv;

    #[test]
    fn test_subspace_duplicate_and_sealed() {
        let env = TestEnv::new();
        let mut keeper = ParamsKeeper::new(env.key(STORE_KEY), env.key(TSTORE_KEY));
        keeper.subspace("auth").unwrap();
        assert!(matches!(keeper.subspace("auth"), Err(Error::DuplicateSubspace(_))));

        keeper.seal();
        assert!(matches!(keeper.subspace("bank"), Err(Error::ParamsSealed(_))));
        assert_eq!(keeper.subspaces().collect::<Vec<_>>(), vec!["auth"]);
    }

    #[test]
    fn test_subspaces_isolated() {
        let mut env = TestEnv::new();
        let mut keeper = ParamsKeeper::new(env.key(STORE_KEY), env.key(TSTORE_KEY));
        let auth = keeper.subspace("auth").unwrap();
        let bank = keeper.subspace("bank").unwrap();

        let mut ctx = env.ctx();
        auth.set(&mut ctx, "max_memo_characters", &256u64).unwrap();

        assert_eq!(auth.get::<u64>(&mut ctx, "max_memo_characters").unwrap(), Some(256));
        assert_eq!(bank.get::<u64>(&mut ctx, "max_memo_characters").unwrap(), None);
        assert!(auth.modified(&mut ctx, "max_memo_characters").unwrap());
        assert!(!bank.modified(&mut ctx, "max_memo_characters").unwrap());
    }
}
