//! Revertable cache branches
//!
//! A [`CacheMultiStore`] buffers every write over a parent [`KvStore`] and
//! holds the only mutable borrow of that parent while it lives. Writes reach
//! the parent through [`CacheMultiStore::write`]; dropping the branch
//! discards them.

use crate::types::StoreKey;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Buffered writes, `None` marks a delete
pub type WriteSet = BTreeMap<(StoreKey, Vec<u8>), Option<Vec<u8>>>;

/// Partitioned key/value access
pub trait KvStore {
    /// Point read
    fn get(&self, store: &StoreKey, key: &[u8]) -> Option<Vec<u8>>;

    /// Insert or overwrite
    fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>);

    /// Remove if present
    fn delete(&mut self, store: &StoreKey, key: &[u8]);

    /// Every entry under `prefix`, ordered by key
    fn prefix_scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Apply buffered writes to a store
pub fn apply_writes(target: &mut dyn KvStore, writes: WriteSet) {
    for ((store, key), value) in writes {
        match value {
            Some(value) => target.set(&store, &key, value),
            None => target.delete(&store, &key),
        }
    }
}

/// Write-buffering branch over a parent store
pub struct CacheMultiStore<'a> {
    parent: &'a mut (dyn KvStore + 'a),
    writes: WriteSet,
}

impl<'a> CacheMultiStore<'a> {
    /// Branch with no buffered writes
    pub fn new(parent: &'a mut (dyn KvStore + 'a)) -> Self {
        Self::with_writes(parent, WriteSet::new())
    }

    /// Branch resuming previously buffered writes
    pub fn with_writes(parent: &'a mut (dyn KvStore + 'a), writes: WriteSet) -> Self {
        Self { parent, writes }
    }

    /// Flush buffered writes into the parent
    pub fn write(self) {
        apply_writes(self.parent, self.writes);
    }

    /// Give up the parent borrow, keeping the buffered writes
    pub fn into_writes(self) -> WriteSet {
        self.writes
    }

    /// Number of buffered operations
    pub fn pending(&self) -> usize {
        self.writes.len()
    }
}

impl KvStore for CacheMultiStore<'_> {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(&(store.clone(), key.to_vec())) {
            Some(buffered) => buffered.clone(),
            None => self.parent.get(store, key),
        }
    }

    fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) {
        self.writes.insert((store.clone(), key.to_vec()), Some(value));
    }

    fn delete(&mut self, store: &StoreKey, key: &[u8]) {
        self.writes.insert((store.clone(), key.to_vec()), None);
    }

    fn prefix_scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.parent.prefix_scan(store, prefix).into_iter().collect();

        let start = (store.clone(), prefix.to_vec());
        let buffered = self
            .writes
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((s, k), _)| s == store && k.starts_with(prefix));

        for ((_, key), value) in buffered {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StoreRegistry;

    #[derive(Default)]
    struct MapStore(BTreeMap<(StoreKey, Vec<u8>), Vec<u8>>);

    impl KvStore for MapStore {
        fn get(&self, store: &StoreKey, key: &[u8]) -> Option<Vec<u8>> {
            self.0.get(&(store.clone(), key.to_vec())).cloned()
        }

        fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) {
            self.0.insert((store.clone(), key.to_vec()), value);
        }

        fn delete(&mut self, store: &StoreKey, key: &[u8]) {
            self.0.remove(&(store.clone(), key.to_vec()));
        }

        fn prefix_scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
            self.0
                .iter()
                .filter(|((s, k), _)| s == store && k.starts_with(prefix))
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect()
        }
    }

    #[test]
    fn test_branch_discard() {
        let keys = StoreRegistry::allocate(["acc"], Vec::<&str>::new()).unwrap();
        let acc = keys.persistent("acc").unwrap();
        let mut root = MapStore::default();
        root.set(&acc, b"a", b"1".to_vec());

        {
            let mut branch = CacheMultiStore::new(&mut root);
            branch.set(&acc, b"a", b"2".to_vec());
            branch.delete(&acc, b"a");
            assert_eq!(branch.get(&acc, b"a"), None);
            // dropped without write
        }

        assert_eq!(root.get(&acc, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_nested_branch_write() {
        let keys = StoreRegistry::allocate(["acc", "bank"], Vec::<&str>::new()).unwrap();
        let acc = keys.persistent("acc").unwrap();
        let bank = keys.persistent("bank").unwrap();
        let mut root = MapStore::default();

        let mut outer = CacheMultiStore::new(&mut root);
        outer.set(&acc, b"x", b"outer".to_vec());
        {
            let mut inner = CacheMultiStore::new(&mut outer);
            inner.set(&bank, b"y", b"inner".to_vec());
            assert_eq!(inner.get(&acc, b"x"), Some(b"outer".to_vec()));
            inner.write();
        }
        assert_eq!(outer.get(&bank, b"y"), Some(b"inner".to_vec()));
        outer.write();

        assert_eq!(root.get(&acc, b"x"), Some(b"outer".to_vec()));
        assert_eq!(root.get(&bank, b"y"), Some(b"inner".to_vec()));
    }

    #[test]
    fn test_prefix_scan_merges_writes() {
        let keys = StoreRegistry::allocate(["acc", "bank"], Vec::<&str>::new()).unwrap();
        let acc = keys.persistent("acc").unwrap();
        let bank = keys.persistent("bank").unwrap();
        let mut root = MapStore::default();
        root.set(&acc, b"p/1", b"a".to_vec());
        root.set(&acc, b"p/2", b"b".to_vec());
        root.set(&acc, b"q/1", b"c".to_vec());

        let mut branch = CacheMultiStore::new(&mut root);
        branch.delete(&acc, b"p/1");
        branch.set(&acc, b"p/3", b"d".to_vec());
        branch.set(&bank, b"p/9", b"other store".to_vec());

        let scanned = branch.prefix_scan(&acc, b"p/");
        assert_eq!(
            scanned,
            vec![(b"p/2".to_vec(), b"b".to_vec()), (b"p/3".to_vec(), b"d".to_vec())]
        );
    }
}
