//! Metrics collection for observability
//!
//! Each [`Application`](crate::Application) owns its own registry, so several
//! instances can live in one process.
//!
//! # Metrics
//!
//! - `app_blocks_total` - Committed blocks
//! - `app_txs_delivered_total` - Transactions that succeeded in DeliverTx
//! - `app_txs_failed_total` - Transactions that failed in DeliverTx
//! - `app_txs_checked_total` - CheckTx requests, by result
//! - `app_tx_gas_used` - Gas used per delivered transaction
//! - `app_block_height` - Last committed height

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed blocks
    pub blocks_total: IntCounter,

    /// Delivered transactions
    pub txs_delivered: IntCounter,

    /// Failed transactions
    pub txs_failed: IntCounter,

    /// CheckTx outcomes
    pub txs_checked: IntCounterVec,

    /// Gas used per transaction
    pub tx_gas_used: Histogram,

    /// Last committed height
    pub block_height: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_total", &self.blocks_total.get())
            .field("txs_delivered", &self.txs_delivered.get())
            .field("txs_failed", &self.txs_failed.get())
            .field("block_height", &self.block_height.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total = IntCounter::new("app_blocks_total", "Committed blocks")?;
        registry.register(Box::new(blocks_total.clone()))?;

        let txs_delivered = IntCounter::new("app_txs_delivered_total", "Transactions delivered successfully")?;
        registry.register(Box::new(txs_delivered.clone()))?;

        let txs_failed = IntCounter::new("app_txs_failed_total", "Transactions that failed in DeliverTx")?;
        registry.register(Box::new(txs_failed.clone()))?;

        let txs_checked = IntCounterVec::new(
            Opts::new("app_txs_checked_total", "CheckTx requests by result"),
            &["result"],
        )?;
        registry.register(Box::new(txs_checked.clone()))?;

        let tx_gas_used = Histogram::with_opts(
            HistogramOpts::new("app_tx_gas_used", "Gas used per delivered transaction").buckets(vec![
                21_000.0, 50_000.0, 100_000.0, 200_000.0, 500_000.0, 1_000_000.0, 5_000_000.0,
            ]),
        )?;
        registry.register(Box::new(tx_gas_used.clone()))?;

        let block_height = IntGauge::new("app_block_height", "Last committed height")?;
        registry.register(Box::new(block_height.clone()))?;

        Ok(Self {
            blocks_total,
            txs_delivered,
            txs_failed,
            txs_checked,
            tx_gas_used,
            block_height,
            registry,
        })
    }

    /// Record a DeliverTx result
    pub fn record_deliver(&self, ok: bool, gas_used: u64) {
        if ok {
            self.txs_delivered.inc();
        } else {
            self.txs_failed.inc();
        }
        self.tx_gas_used.observe(gas_used as f64);
    }

    /// Record a CheckTx result
    pub fn record_check(&self, ok: bool) {
        let result = if ok { "accepted" } else { "rejected" };
        self.txs_checked.with_label_values(&[result]).inc();
    }

    /// Record a commit
    pub fn record_commit(&self, height: u64) {
        self.blocks_total.inc();
        self.block_height.set(i64::try_from(height).unwrap_or(i64::MAX));
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.blocks_total.get(), 0);
        assert_eq!(metrics.txs_delivered.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_commit(4);
        assert_eq!(a.block_height.get(), 4);
        assert_eq!(b.block_height.get(), 0);
    }

    #[test]
    fn test_record_deliver_and_check() {
        let metrics = Metrics::new().unwrap();
        metrics.record_deliver(true, 30_000);
        metrics.record_deliver(false, 1_000);
        metrics.record_check(false);
        assert_eq!(metrics.txs_delivered.get(), 1);
        assert_eq!(metrics.txs_failed.get(), 1);
        assert_eq!(metrics.txs_checked.with_label_values(&["rejected"]).get(), 1);
        assert!(metrics.gather_text().unwrap().contains("app_txs_failed_total 1"));
    }
}
