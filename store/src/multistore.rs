//! Versioned multistore
//!
//! Holds the working state of every mounted partition in memory. On commit,
//! each partition written since the previous commit persists only its
//! changed keys, keyed by `name || 0x00 || version`. Every
//! `snapshot_interval` versions each partition is also written in full under
//! `name || 0x01 || version`. Loading a version reads the nearest snapshot at
//! or below it and replays the change sets after that.
//!
//! Committing on top of a reloaded older version discards every persisted
//! version above it first, so an abandoned history is never mixed into a
//! later load.
//!
//! # Invariants
//!
//! - The application hash is the Merkle root of `H(name || H(partition))`
//!   over persistent partitions ordered by name
//! - Transient partitions are empty after every commit and never persisted
//! - Loading a version reproduces the partition hashes recorded for it
//! - Loading the same version twice yields identical partition contents

use crate::{
    cache::KvStore,
    config::PruningConfig,
    crypto::{hash_bytes, merkle_root},
    registry::StoreKeys,
    storage::{Column, Database, DbBatch},
    trace::{TraceOp, TraceOperation, Tracer},
    types::{CommitId, StoreKey, StoreKind},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const LATEST_KEY: &[u8] = b"latest";
const EARLIEST_KEY: &[u8] = b"earliest";
const COMMIT_PREFIX: &[u8] = b"commit/";

const CHANGES_TAG: u8 = 0x00;
const SNAPSHOT_TAG: u8 = 0x01;

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

/// Keys written since the last commit; `None` is a deletion
type ChangeSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Per-version commit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Committed version
    pub version: u64,
    /// Application hash
    pub hash: [u8; 32],
    /// Partition hashes, ordered by name
    pub store_hashes: Vec<(String, [u8; 32])>,
}

#[derive(Debug, Clone)]
struct Partition {
    entries: Entries,
    changes: ChangeSet,
    hash: [u8; 32],
}

impl Partition {
    fn new(entries: Entries) -> Result<Self> {
        let hash = partition_hash(&entries)?;
        Ok(Self {
            entries,
            changes: ChangeSet::new(),
            hash,
        })
    }

    fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Root store persisted through a [`Database`]
pub struct CommitMultiStore {
    db: Arc<dyn Database>,
    pruning: PruningConfig,
    persistent: BTreeMap<StoreKey, Partition>,
    transient: BTreeMap<StoreKey, Entries>,
    last_commit: CommitId,
    tracer: Option<Tracer>,
    pending_trace: Vec<TraceOp>,
}

impl fmt::Debug for CommitMultiStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitMultiStore")
            .field("persistent", &self.persistent.keys().collect::<Vec<_>>())
            .field("transient", &self.transient.keys().collect::<Vec<_>>())
            .field("last_commit", &self.last_commit)
            .field("pruning", &self.pruning)
            .finish()
    }
}

impl CommitMultiStore {
    /// Create a store over `db` with nothing mounted and default retention
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            pruning: PruningConfig::default(),
            persistent: BTreeMap::new(),
            transient: BTreeMap::new(),
            last_commit: CommitId::default(),
            tracer: None,
            pending_trace: Vec::new(),
        }
    }

    /// Create a store with an explicit retention policy
    pub fn with_pruning(db: Arc<dyn Database>, pruning: PruningConfig) -> Result<Self> {
        pruning.validate()?;
        let mut store = Self::new(db);
        store.pruning = pruning;
        Ok(store)
    }

    /// Attach a trace sink for committed writes
    pub fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = Some(tracer);
    }

    /// Mount every allocated partition
    pub fn mount_stores(&mut self, keys: &StoreKeys) -> Result<()> {
        for key in keys.all() {
            match key.kind() {
                StoreKind::Persistent => {
                    self.persistent
                        .insert(key.clone(), Partition::new(Entries::new())?);
                }
                StoreKind::Transient => {
                    self.transient.insert(key.clone(), Entries::new());
                }
            }
        }
        Ok(())
    }

    /// Last committed version and hash
    pub fn last_commit_id(&self) -> CommitId {
        self.last_commit
    }

    /// Latest version recorded in the database (0 if none)
    pub fn latest_version(&self) -> Result<u64> {
        self.meta_version(LATEST_KEY)
    }

    /// Oldest version still loadable (0 until something is pruned)
    pub fn earliest_version(&self) -> Result<u64> {
        self.meta_version(EARLIEST_KEY)
    }

    /// Commit record of `version`
    pub fn commit_info(&self, version: u64) -> Result<Option<CommitInfo>> {
        match self.db.get(Column::Meta, &commit_key(version))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the latest committed version
    pub fn load_latest_version(&mut self) -> Result<()> {
        let latest = self.latest_version()?;
        self.load_version(latest)
    }

    /// Replace working state with the partitions as of `version`
    ///
    /// Version 0 is the empty pre-genesis state. Nothing is deleted here;
    /// versions above `version` stay loadable until the next commit.
    pub fn load_version(&mut self, version: u64) -> Result<()> {
        let info = if version == 0 {
            None
        } else {
            let earliest = self.earliest_version()?;
            if version < earliest {
                return Err(Error::VersionPruned { version, earliest });
            }
            Some(
                self.commit_info(version)?
                    .ok_or(Error::VersionNotFound(version))?,
            )
        };

        let mut loaded = BTreeMap::new();
        for key in self.persistent.keys() {
            let entries = if version == 0 {
                Entries::new()
            } else {
                self.read_partition(key.name(), version)?
            };
            let partition = Partition::new(entries)?;
            let recorded = info
                .as_ref()
                .and_then(|info| info.store_hashes.iter().find(|(name, _)| name == key.name()));
            if let Some((_, hash)) = recorded {
                if *hash != partition.hash {
                    return Err(Error::Corrupted(format!(
                        "partition {} at version {} does not match its recorded hash",
                        key.name(),
                        version
                    )));
                }
            }
            loaded.insert(key.clone(), partition);
        }
        self.persistent = loaded;

        for entries in self.transient.values_mut() {
            entries.clear();
        }
        self.pending_trace.clear();
        self.last_commit = match info {
            Some(info) => CommitId {
                version,
                hash: info.hash,
            },
            None => CommitId::default(),
        };

        tracing::info!(version, hash = %hex::encode(self.last_commit.hash), "Loaded store version");
        Ok(())
    }

    /// Persist changed keys as the next version
    pub fn commit(&mut self) -> Result<CommitId> {
        let version = self.last_commit.version + 1;
        let mut batch = DbBatch::new();

        let latest = self.latest_version()?;
        if latest >= version {
            tracing::warn!(from = version, to = latest, "Discarding versions above reloaded height");
            self.discard_versions(&mut batch, version, latest)?;
        }

        let snapshot = self.pruning.snapshot_interval > 0 && version % self.pruning.snapshot_interval == 0;
        let mut dirty = 0usize;
        for (key, partition) in self.persistent.iter_mut() {
            if partition.is_dirty() {
                let changes = std::mem::take(&mut partition.changes);
                batch.put(
                    Column::Partitions,
                    versioned_key(key.name(), CHANGES_TAG, version),
                    bincode::serialize(&changes)?,
                );
                partition.hash = partition_hash(&partition.entries)?;
                dirty += 1;
            }
            if snapshot {
                batch.put(
                    Column::Partitions,
                    versioned_key(key.name(), SNAPSHOT_TAG, version),
                    bincode::serialize(&partition.entries)?,
                );
            }
        }

        let store_hashes = self.store_hashes();
        let hash = app_hash(&store_hashes);
        let info = CommitInfo {
            version,
            hash,
            store_hashes,
        };

        batch.put(Column::Meta, commit_key(version), bincode::serialize(&info)?);
        batch.put(Column::Meta, LATEST_KEY.to_vec(), bincode::serialize(&version)?);
        self.prune(&mut batch, version)?;
        self.db.write(batch)?;

        for entries in self.transient.values_mut() {
            entries.clear();
        }

        if let Some(tracer) = self.tracer.as_mut() {
            for mut op in self.pending_trace.drain(..) {
                op.version = version;
                tracer.trace(&op)?;
            }
            tracer.flush()?;
        } else {
            self.pending_trace.clear();
        }

        self.last_commit = CommitId { version, hash };

        tracing::debug!(version, dirty_partitions = dirty, snapshot, hash = %hex::encode(hash), "Committed stores");
        Ok(self.last_commit)
    }

    /// Current partition hashes, ordered by name
    ///
    /// Reflects working state only for partitions already hashed by a commit
    /// or load; uncommitted writes are not included.
    pub fn store_hashes(&self) -> Vec<(String, [u8; 32])> {
        self.persistent
            .iter()
            .map(|(key, partition)| (key.name().to_string(), partition.hash))
            .collect()
    }

    fn meta_version(&self, key: &[u8]) -> Result<u64> {
        match self.db.get(Column::Meta, key)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(0),
        }
    }

    /// Nearest snapshot at or below `version`, then every later change set
    fn read_partition(&self, name: &str, version: u64) -> Result<Entries> {
        let prefix = tagged_prefix(name, SNAPSHOT_TAG);
        let (base, mut entries) = match self.db.seek_prev(
            Column::Partitions,
            &prefix,
            &versioned_key(name, SNAPSHOT_TAG, version),
        )? {
            Some((key, bytes)) => (version_of(&key)?, bincode::deserialize::<Entries>(&bytes)?),
            None => (0, Entries::new()),
        };
        if base == version {
            return Ok(entries);
        }

        let from = versioned_key(name, CHANGES_TAG, base + 1);
        let to = versioned_key(name, CHANGES_TAG, version);
        for (_, bytes) in self.db.scan(Column::Partitions, &from, &to)? {
            let changes: ChangeSet = bincode::deserialize(&bytes)?;
            for (key, value) in changes {
                match value {
                    Some(value) => {
                        entries.insert(key, value);
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Queue deletion of every persisted record for versions `from..=to`
    fn discard_versions(&self, batch: &mut DbBatch, from: u64, to: u64) -> Result<()> {
        for key in self.persistent.keys() {
            for tag in [CHANGES_TAG, SNAPSHOT_TAG] {
                let records = self.db.scan(
                    Column::Partitions,
                    &versioned_key(key.name(), tag, from),
                    &versioned_key(key.name(), tag, to),
                )?;
                for (record, _) in records {
                    batch.delete(Column::Partitions, record);
                }
            }
        }
        for (record, _) in self.db.scan(Column::Meta, &commit_key(from), &commit_key(to))? {
            batch.delete(Column::Meta, record);
        }
        Ok(())
    }

    /// Queue deletion of history older than the retention window
    ///
    /// The new earliest version is the newest snapshot at or below
    /// `version - keep_recent`; everything before it is dropped.
    fn prune(&self, batch: &mut DbBatch, version: u64) -> Result<()> {
        let keep_recent = self.pruning.keep_recent;
        let snapshot_interval = self.pruning.snapshot_interval;
        if keep_recent == 0 || snapshot_interval == 0 || version <= keep_recent {
            return Ok(());
        }
        let base = (version - keep_recent) / snapshot_interval * snapshot_interval;
        let earliest = self.earliest_version()?;
        if base == 0 || base <= earliest {
            return Ok(());
        }
        for key in self.persistent.keys() {
            let snapshot = versioned_key(key.name(), SNAPSHOT_TAG, base);
            if self.db.get(Column::Partitions, &snapshot)?.is_none() {
                tracing::debug!(store = %key, base, "No snapshot at pruning base, keeping history");
                return Ok(());
            }
        }

        for key in self.persistent.keys() {
            let stale = self
                .db
                .scan(
                    Column::Partitions,
                    &versioned_key(key.name(), CHANGES_TAG, 0),
                    &versioned_key(key.name(), CHANGES_TAG, base),
                )?
                .into_iter()
                .chain(self.db.scan(
                    Column::Partitions,
                    &versioned_key(key.name(), SNAPSHOT_TAG, 0),
                    &versioned_key(key.name(), SNAPSHOT_TAG, base - 1),
                )?);
            for (record, _) in stale {
                batch.delete(Column::Partitions, record);
            }
        }
        for (record, _) in self.db.scan(Column::Meta, &commit_key(0), &commit_key(base - 1))? {
            batch.delete(Column::Meta, record);
        }
        batch.put(Column::Meta, EARLIEST_KEY.to_vec(), bincode::serialize(&base)?);

        tracing::info!(earliest = base, latest = version, "Pruned store versions");
        Ok(())
    }

    fn trace(&mut self, operation: TraceOperation, store: &StoreKey, key: &[u8], value: &[u8]) {
        if self.tracer.is_none() || store.is_transient() {
            return;
        }
        self.pending_trace.push(TraceOp {
            operation,
            store: store.name().to_string(),
            key: hex::encode(key),
            value: hex::encode(value),
            version: 0,
        });
    }
}

impl KvStore for CommitMultiStore {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Option<Vec<u8>> {
        match store.kind() {
            StoreKind::Persistent => self
                .persistent
                .get(store)
                .and_then(|p| p.entries.get(key).cloned()),
            StoreKind::Transient => self.transient.get(store).and_then(|e| e.get(key).cloned()),
        }
    }

    fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) {
        self.trace(TraceOperation::Write, store, key, &value);
        match store.kind() {
            StoreKind::Persistent => {
                if let Some(partition) = self.persistent.get_mut(store) {
                    partition.entries.insert(key.to_vec(), value.clone());
                    partition.changes.insert(key.to_vec(), Some(value));
                } else {
                    tracing::error!(store = %store, "Write to unmounted partition dropped");
                }
            }
            StoreKind::Transient => {
                if let Some(entries) = self.transient.get_mut(store) {
                    entries.insert(key.to_vec(), value);
                } else {
                    tracing::error!(store = %store, "Write to unmounted partition dropped");
                }
            }
        }
    }

    fn delete(&mut self, store: &StoreKey, key: &[u8]) {
        self.trace(TraceOperation::Delete, store, key, &[]);
        match store.kind() {
            StoreKind::Persistent => {
                if let Some(partition) = self.persistent.get_mut(store) {
                    if partition.entries.remove(key).is_some() {
                        partition.changes.insert(key.to_vec(), None);
                    }
                }
            }
            StoreKind::Transient => {
                if let Some(entries) = self.transient.get_mut(store) {
                    entries.remove(key);
                }
            }
        }
    }

    fn prefix_scan(&self, store: &StoreKey, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let entries = match store.kind() {
            StoreKind::Persistent => self.persistent.get(store).map(|p| &p.entries),
            StoreKind::Transient => self.transient.get(store),
        };
        entries
            .map(|entries| {
                entries
                    .range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn app_hash(store_hashes: &[(String, [u8; 32])]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = store_hashes
        .iter()
        .map(|(name, hash)| {
            let mut leaf = name.as_bytes().to_vec();
            leaf.extend_from_slice(hash);
            hash_bytes(&leaf)
        })
        .collect();
    merkle_root(&leaves)
}

fn partition_hash(entries: &Entries) -> Result<[u8; 32]> {
    Ok(hash_bytes(&bincode::serialize(entries)?))
}

fn tagged_prefix(name: &str, tag: u8) -> Vec<u8> {
    let mut key = name.as_bytes().to_vec();
    key.push(tag);
    key
}

fn versioned_key(name: &str, tag: u8, version: u64) -> Vec<u8> {
    let mut key = tagged_prefix(name, tag);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn version_of(key: &[u8]) -> Result<u64> {
    key.len()
        .checked_sub(8)
        .and_then(|start| <[u8; 8]>::try_from(&key[start..]).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| Error::Corrupted(format!("malformed partition key {}", hex::encode(key))))
}

fn commit_key(version: u64) -> Vec<u8> {
    let mut key = COMMIT_PREFIX.to_vec();
    key.extend_from_slice(&version.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::StoreRegistry, storage::MemDatabase, Config};
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::TempDir;

    fn keys() -> StoreKeys {
        StoreRegistry::allocate(["acc", "staking"], ["transient_staking"]).unwrap()
    }

    fn mem_store() -> (CommitMultiStore, StoreKeys) {
        let keys = keys();
        let mut cms = CommitMultiStore::new(Arc::new(MemDatabase::new()));
        cms.mount_stores(&keys).unwrap();
        (cms, keys)
    }

    fn pruned_store(keep_recent: u64, snapshot_interval: u64) -> (CommitMultiStore, StoreKeys, Arc<MemDatabase>) {
        let keys = keys();
        let db = Arc::new(MemDatabase::new());
        let pruning = PruningConfig {
            keep_recent,
            snapshot_interval,
        };
        let mut cms = CommitMultiStore::with_pruning(db.clone(), pruning).unwrap();
        cms.mount_stores(&keys).unwrap();
        (cms, keys, db)
    }

    fn recomputed_hash(cms: &CommitMultiStore, keys: &StoreKeys) -> [u8; 32] {
        let hashes: Vec<(String, [u8; 32])> = keys
            .persistent_keys()
            .map(|key| {
                let entries: Entries = cms.prefix_scan(key, b"").into_iter().collect();
                (key.name().to_string(), partition_hash(&entries).unwrap())
            })
            .collect();
        app_hash(&hashes)
    }

    #[test]
    fn test_commit_and_load_version() {
        let (mut cms, keys) = mem_store();
        let acc = keys.persistent("acc").unwrap();
        let staking = keys.persistent("staking").unwrap();

        cms.set(&acc, b"alice", b"100".to_vec());
        cms.set(&staking, b"val", b"10".to_vec());
        let v1 = cms.commit().unwrap();
        assert_eq!(v1.version, 1);

        cms.set(&acc, b"alice", b"90".to_vec());
        let v2 = cms.commit().unwrap();
        assert_ne!(v1.hash, v2.hash);

        cms.load_version(1).unwrap();
        assert_eq!(cms.get(&acc, b"alice"), Some(b"100".to_vec()));
        assert_eq!(cms.get(&staking, b"val"), Some(b"10".to_vec()));
        assert_eq!(cms.last_commit_id(), v1);

        cms.load_latest_version().unwrap();
        assert_eq!(cms.get(&acc, b"alice"), Some(b"90".to_vec()));
        // staking was untouched at v2, found through the v1 snapshot
        assert_eq!(cms.get(&staking, b"val"), Some(b"10".to_vec()));
        assert_eq!(cms.last_commit_id(), v2);
    }

    #[test]
    fn test_commit_after_reload_discards_abandoned_versions() {
        let (mut cms, keys) = mem_store();
        let acc = keys.persistent("acc").unwrap();
        let staking = keys.persistent("staking").unwrap();

        cms.set(&staking, b"val", b"10".to_vec());
        cms.commit().unwrap();
        cms.set(&staking, b"val", b"99".to_vec());
        cms.commit().unwrap();
        cms.set(&acc, b"alice", b"1".to_vec());
        cms.commit().unwrap();

        cms.load_version(1).unwrap();
        // reloading alone keeps the later versions
        cms.load_version(3).unwrap();
        cms.load_version(1).unwrap();

        cms.set(&acc, b"bob", b"5".to_vec());
        let forked = cms.commit().unwrap();
        assert_eq!(forked.version, 2);
        assert_eq!(cms.latest_version().unwrap(), 2);
        assert_eq!(cms.get(&staking, b"val"), Some(b"10".to_vec()));

        cms.load_version(2).unwrap();
        assert_eq!(cms.last_commit_id(), forked);
        assert_eq!(cms.get(&staking, b"val"), Some(b"10".to_vec()));
        assert_eq!(cms.get(&acc, b"alice"), None);
        assert_eq!(cms.get(&acc, b"bob"), Some(b"5".to_vec()));
        assert_eq!(recomputed_hash(&cms, &keys), forked.hash);
        assert!(matches!(cms.load_version(3), Err(Error::VersionNotFound(3))));
    }

    #[test]
    fn test_commit_persists_only_changed_keys() {
        let (mut cms, keys, db) = pruned_store(0, 0);
        let acc = keys.persistent("acc").unwrap();

        for i in 0u8..50 {
            cms.set(&acc, &[i], vec![i; 32]);
        }
        cms.commit().unwrap();
        cms.set(&acc, &[7], b"x".to_vec());
        cms.delete(&acc, &[8]);
        cms.commit().unwrap();

        let bytes = db
            .get(Column::Partitions, &versioned_key("acc", CHANGES_TAG, 2))
            .unwrap()
            .unwrap();
        let changes: ChangeSet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get(&vec![7]), Some(&Some(b"x".to_vec())));
        assert_eq!(changes.get(&vec![8]), Some(&None));
        // untouched partitions write nothing
        assert!(db
            .get(Column::Partitions, &versioned_key("staking", CHANGES_TAG, 2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_snapshots_and_pruning() {
        let (mut cms, keys, db) = pruned_store(3, 2);
        let acc = keys.persistent("acc").unwrap();

        let mut ids = Vec::new();
        for height in 1u64..=9 {
            cms.set(&acc, b"height", height.to_be_bytes().to_vec());
            cms.set(&acc, &height.to_be_bytes(), b"seen".to_vec());
            ids.push(cms.commit().unwrap());
        }

        // latest 9, keep 3 => base is the snapshot at 6
        assert_eq!(cms.earliest_version().unwrap(), 6);
        assert!(matches!(
            cms.load_version(5),
            Err(Error::VersionPruned { version: 5, earliest: 6 })
        ));
        assert!(cms.commit_info(5).unwrap().is_none());
        assert!(db
            .get(Column::Partitions, &versioned_key("acc", CHANGES_TAG, 6))
            .unwrap()
            .is_none());

        for id in &ids[5..] {
            cms.load_version(id.version).unwrap();
            assert_eq!(cms.last_commit_id(), *id);
            assert_eq!(cms.get(&acc, b"height"), Some(id.version.to_be_bytes().to_vec()));
            assert_eq!(cms.get(&acc, &1u64.to_be_bytes()), Some(b"seen".to_vec()));
        }
    }

    #[test]
    fn test_load_detects_corruption() {
        let (mut cms, keys, db) = pruned_store(0, 0);
        let acc = keys.persistent("acc").unwrap();
        cms.set(&acc, b"alice", b"1".to_vec());
        cms.commit().unwrap();

        let mut forged = ChangeSet::new();
        forged.insert(b"alice".to_vec(), Some(b"2".to_vec()));
        let mut batch = DbBatch::new();
        batch.put(
            Column::Partitions,
            versioned_key("acc", CHANGES_TAG, 1),
            bincode::serialize(&forged).unwrap(),
        );
        db.write(batch).unwrap();

        assert!(matches!(cms.load_version(1), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_load_unknown_version() {
        let (mut cms, _) = mem_store();
        assert!(matches!(cms.load_version(7), Err(Error::VersionNotFound(7))));
    }

    #[test]
    fn test_transient_cleared_on_commit() {
        let (mut cms, keys) = mem_store();
        let tkey = keys.transient("transient_staking").unwrap();

        cms.set(&tkey, b"k", b"v".to_vec());
        assert_eq!(cms.get(&tkey, b"k"), Some(b"v".to_vec()));
        cms.commit().unwrap();
        assert_eq!(cms.get(&tkey, b"k"), None);
    }

    #[test]
    fn test_app_hash_deterministic() {
        let (mut a, keys_a) = mem_store();
        let (mut b, keys_b) = mem_store();

        for (cms, keys) in [(&mut a, &keys_a), (&mut b, &keys_b)] {
            let acc = keys.persistent("acc").unwrap();
            cms.set(&acc, b"k1", b"v1".to_vec());
            cms.set(&acc, b"k2", b"v2".to_vec());
        }

        assert_eq!(a.commit().unwrap(), b.commit().unwrap());
    }

    #[test]
    fn test_reopen_rocksdb() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let keys = keys();
        let acc = keys.persistent("acc").unwrap();
        let committed = {
            let db = Arc::new(crate::storage::RocksDatabase::open(&config).unwrap());
            let mut cms = CommitMultiStore::new(db);
            cms.mount_stores(&keys).unwrap();
            cms.set(&acc, b"alice", b"1".to_vec());
            cms.commit().unwrap()
        };

        let db = Arc::new(crate::storage::RocksDatabase::open(&config).unwrap());
        let mut cms = CommitMultiStore::new(db);
        cms.mount_stores(&keys).unwrap();
        cms.load_latest_version().unwrap();
        assert_eq!(cms.last_commit_id(), committed);
        assert_eq!(cms.get(&acc, b"alice"), Some(b"1".to_vec()));
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracer_lines() {
        let (mut cms, keys) = mem_store();
        let buf = SharedBuf::default();
        cms.set_tracer(Tracer::new(Box::new(buf.clone())));

        let acc = keys.persistent("acc").unwrap();
        cms.set(&acc, b"k", b"v".to_vec());
        cms.delete(&acc, b"k");
        cms.commit().unwrap();

        let output = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["operation"], "write");
        assert_eq!(lines[0]["store"], "acc");
        assert_eq!(lines[0]["key"], hex::encode(b"k"));
        assert_eq!(lines[1]["operation"], "delete");
        assert_eq!(lines[1]["version"], 1);
    }
}
