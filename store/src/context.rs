//! Execution context
//!
//! A [`Context`] is what a module sees while handling a hook, a message or a
//! query: a cache branch over the multistore, the block header, the
//! execution mode, a gas meter and the events emitted so far.
//!
//! Every store access is metered. Values are stored with bincode through
//! [`Context::get_value`] / [`Context::set_value`].

use crate::{
    cache::{apply_writes, CacheMultiStore, KvStore, WriteSet},
    gas::{GasConfig, GasMeter},
    types::{BlockHeader, Event, ExecMode, StoreKey},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Per-call execution state
pub struct Context<'a> {
    store: CacheMultiStore<'a>,
    header: BlockHeader,
    mode: ExecMode,
    gas_meter: GasMeter,
    gas_config: GasConfig,
    events: Vec<Event>,
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("header", &self.header)
            .field("mode", &self.mode)
            .field("gas_meter", &self.gas_meter)
            .field("pending_writes", &self.store.pending())
            .field("events", &self.events.len())
            .finish()
    }
}

impl<'a> Context<'a> {
    /// Branch over `parent` with an infinite gas meter
    pub fn new(parent: &'a mut (dyn KvStore + 'a), header: BlockHeader, mode: ExecMode) -> Self {
        Self::with_writes(parent, WriteSet::new(), header, mode)
    }

    /// Branch resuming writes buffered by an earlier context
    pub fn with_writes(
        parent: &'a mut (dyn KvStore + 'a),
        writes: WriteSet,
        header: BlockHeader,
        mode: ExecMode,
    ) -> Self {
        Self {
            store: CacheMultiStore::with_writes(parent, writes),
            header,
            mode,
            gas_meter: GasMeter::infinite(),
            gas_config: GasConfig::default(),
            events: Vec::new(),
        }
    }

    // ---- header ----

    /// Block header
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Chain identifier
    pub fn chain_id(&self) -> &str {
        &self.header.chain_id
    }

    /// Current block height
    pub fn block_height(&self) -> u64 {
        self.header.height
    }

    /// Current block time
    pub fn block_time(&self) -> DateTime<Utc> {
        self.header.time
    }

    /// Execution mode
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// True during mempool admission
    pub fn is_check_tx(&self) -> bool {
        self.mode == ExecMode::Check
    }

    /// True while applying genesis
    pub fn is_genesis(&self) -> bool {
        self.mode == ExecMode::Genesis
    }

    // ---- gas ----

    /// Installed gas meter
    pub fn gas_meter(&self) -> &GasMeter {
        &self.gas_meter
    }

    /// Replace the gas meter
    pub fn set_gas_meter(&mut self, meter: GasMeter) {
        self.gas_meter = meter;
    }

    /// Charge gas outside of store access
    pub fn consume_gas(&mut self, amount: u64, descriptor: &str) -> Result<()> {
        self.gas_meter.consume(amount, descriptor)
    }

    // ---- store access ----

    /// Metered point read
    pub fn get(&mut self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.gas_meter
            .consume(self.gas_config.read_cost_flat, "ReadFlat")?;
        let value = self.store.get(store, key);
        if let Some(value) = &value {
            self.gas_meter.consume(
                self.gas_config.read_cost_per_byte * value.len() as u64,
                "ReadPerByte",
            )?;
        }
        Ok(value)
    }

    /// Metered existence check
    pub fn has(&mut self, store: &StoreKey, key: &[u8]) -> Result<bool> {
        self.gas_meter.consume(self.gas_config.has_cost, "Has")?;
        Ok(self.store.get(store, key).is_some())
    }

    /// Metered write
    pub fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.gas_meter
            .consume(self.gas_config.write_cost_flat, "WriteFlat")?;
        self.gas_meter.consume(
            self.gas_config.write_cost_per_byte * (key.len() + value.len()) as u64,
            "WritePerByte",
        )?;
        self.store.set(store, key, value);
        Ok(())
    }

    /// Metered delete
    pub fn delete(&mut self, store: &StoreKey, key: &[u8]) -> Result<()> {
        self.gas_meter.consume(self.gas_config.delete_cost, "Delete")?;
        self.store.delete(store, key);
        Ok(())
    }

    /// Metered prefix scan, ordered by key
    pub fn prefix_scan(&mut self, store: &StoreKey, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.store.prefix_scan(store, prefix);
        for (key, value) in &entries {
            self.gas_meter
                .consume(self.gas_config.iter_next_cost_flat, "IterNextFlat")?;
            self.gas_meter.consume(
                self.gas_config.read_cost_per_byte * (key.len() + value.len()) as u64,
                "ValuePerByte",
            )?;
        }
        Ok(entries)
    }

    /// Read and decode a bincode value
    pub fn get_value<T: DeserializeOwned>(&mut self, store: &StoreKey, key: &[u8]) -> Result<Option<T>> {
        match self.get(store, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a bincode value
    pub fn set_value<T: Serialize>(&mut self, store: &StoreKey, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.set(store, key, bytes)
    }

    /// Decode every value under `prefix`
    pub fn scan_values<T: DeserializeOwned>(
        &mut self,
        store: &StoreKey,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        self.prefix_scan(store, prefix)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, bincode::deserialize(&bytes)?)))
            .collect()
    }

    // ---- events ----

    /// Record an event
    pub fn emit_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Events emitted so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Drain emitted events
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // ---- branching ----

    /// Run `f` in a nested branch
    ///
    /// Writes and events of the branch are kept only if `f` succeeds. Gas
    /// consumed inside the branch is charged either way.
    pub fn atomic<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Context<'_>) -> std::result::Result<T, E>,
    {
        let header = self.header.clone();
        let meter = self.gas_meter.clone();
        let mode = self.mode;
        let gas_config = self.gas_config;

        let (result, writes, events, meter) = {
            let mut branch = Context::new(&mut self.store, header, mode);
            branch.gas_meter = meter;
            branch.gas_config = gas_config;
            let result = f(&mut branch);
            let (writes, events, meter) = branch.into_parts();
            (result, writes, events, meter)
        };

        self.gas_meter = meter;
        if result.is_ok() {
            apply_writes(&mut self.store, writes);
            self.events.extend(events);
        }
        result
    }

    /// Flush buffered writes into the parent, returning events and gas
    pub fn write(self) -> (Vec<Event>, GasMeter) {
        self.store.write();
        (self.events, self.gas_meter)
    }

    /// Release the parent, returning buffered writes, events and gas
    pub fn into_parts(self) -> (WriteSet, Vec<Event>, GasMeter) {
        (self.store.into_writes(), self.events, self.gas_meter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{multistore::CommitMultiStore, registry::StoreRegistry, storage::MemDatabase, Error};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn header() -> BlockHeader {
        BlockHeader {
            chain_id: "test-chain".to_string(),
            height: 5,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn store() -> (CommitMultiStore, StoreKey) {
        let keys = StoreRegistry::allocate(["acc"], Vec::<&str>::new()).unwrap();
        let mut cms = CommitMultiStore::new(Arc::new(MemDatabase::new()));
        cms.mount_stores(&keys).unwrap();
        (cms, keys.persistent("acc").unwrap())
    }

    #[test]
    fn test_typed_values() {
        let (mut cms, acc) = store();
        let mut ctx = Context::new(&mut cms, header(), ExecMode::Deliver);

        ctx.set_value(&acc, b"n/1", &42u64).unwrap();
        ctx.set_value(&acc, b"n/2", &7u64).unwrap();
        assert_eq!(ctx.get_value::<u64>(&acc, b"n/1").unwrap(), Some(42));
        assert_eq!(ctx.get_value::<u64>(&acc, b"missing").unwrap(), None);

        let all: Vec<u64> = ctx
            .scan_values::<u64>(&acc, b"n/")
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(all, vec![42, 7]);

        ctx.write();
        assert!(cms.get(&acc, b"n/1").is_some());
    }

    #[test]
    fn test_atomic_discards_on_error() {
        let (mut cms, acc) = store();
        let mut ctx = Context::new(&mut cms, header(), ExecMode::Deliver);
        ctx.set(&acc, b"kept", b"1".to_vec()).unwrap();

        let result: std::result::Result<(), Error> = ctx.atomic(|branch| {
            branch.set(&acc, b"dropped", b"2".to_vec())?;
            branch.emit_event(Event::new("dropped"));
            Err(Error::Other("fail".into()))
        });
        assert!(result.is_err());
        assert!(ctx.get(&acc, b"dropped").unwrap().is_none());
        assert!(ctx.events().is_empty());
        // gas from the failed branch is still charged
        assert!(ctx.gas_meter().consumed() > 2 * GasConfig::default().write_cost_flat);

        ctx.atomic(|branch| {
            branch.emit_event(Event::new("kept").attr("k", 1));
            branch.set(&acc, b"also_kept", b"3".to_vec())
        })
        .unwrap();
        assert!(ctx.get(&acc, b"also_kept").unwrap().is_some());
        assert_eq!(ctx.events()[0].get("k"), Some("1"));
    }

    #[test]
    fn test_out_of_gas() {
        let (mut cms, acc) = store();
        let mut ctx = Context::new(&mut cms, header(), ExecMode::Deliver);
        ctx.set_gas_meter(GasMeter::with_limit(1500));

        ctx.has(&acc, b"x").unwrap();
        let err = ctx.set(&acc, b"x", b"y".to_vec()).unwrap_err();
        assert!(matches!(err, Error::OutOfGas { .. }));
    }

    #[test]
    fn test_header_accessors() {
        let (mut cms, _) = store();
        let ctx = Context::new(&mut cms, header(), ExecMode::Check);
        assert_eq!(ctx.chain_id(), "test-chain");
        assert_eq!(ctx.block_height(), 5);
        assert!(ctx.is_check_tx());
        assert!(!ctx.is_genesis());
    }
}
