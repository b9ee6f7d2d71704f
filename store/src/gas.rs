//! Gas accounting
//!
//! Every store access through a [`Context`](crate::context::Context) is
//! charged against its [`GasMeter`] using the costs in [`GasConfig`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Store access costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasConfig {
    /// Existence check
    pub has_cost: u64,
    /// Delete
    pub delete_cost: u64,
    /// Flat cost of a read
    pub read_cost_flat: u64,
    /// Per byte of value read
    pub read_cost_per_byte: u64,
    /// Flat cost of a write
    pub write_cost_flat: u64,
    /// Per byte of key and value written
    pub write_cost_per_byte: u64,
    /// Per entry returned by a scan
    pub iter_next_cost_flat: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            has_cost: 1000,
            delete_cost: 1000,
            read_cost_flat: 1000,
            read_cost_per_byte: 3,
            write_cost_flat: 2000,
            write_cost_per_byte: 30,
            iter_next_cost_flat: 30,
        }
    }
}

/// Tracks gas consumed against an optional limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasMeter {
    limit: Option<u64>,
    consumed: u64,
}

impl GasMeter {
    /// Meter without a limit (genesis, block hooks, queries)
    pub fn infinite() -> Self {
        Self {
            limit: None,
            consumed: 0,
        }
    }

    /// Meter that fails once `limit` is exceeded
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            consumed: 0,
        }
    }

    /// Charge `amount`
    ///
    /// The charge is recorded even when it overflows the limit, so the
    /// reported consumption reflects the failing operation.
    pub fn consume(&mut self, amount: u64, descriptor: &str) -> Result<()> {
        self.consumed = self.consumed.saturating_add(amount);
        match self.limit {
            Some(limit) if self.consumed > limit => Err(Error::OutOfGas {
                descriptor: descriptor.to_string(),
                limit,
                consumed: self.consumed,
            }),
            _ => Ok(()),
        }
    }

    /// Return gas to the meter, never below zero
    pub fn refund(&mut self, amount: u64) {
        self.consumed = self.consumed.saturating_sub(amount);
    }

    /// Gas consumed so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Installed limit, `None` when infinite
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Gas left before the limit, `u64::MAX` when infinite
    pub fn remaining(&self) -> u64 {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.consumed),
            None => u64::MAX,
        }
    }

    /// True once consumption has passed the limit
    pub fn is_exhausted(&self) -> bool {
        matches!(self.limit, Some(limit) if self.consumed > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_meter() {
        let mut meter = GasMeter::infinite();
        meter.consume(u64::MAX, "huge").unwrap();
        meter.consume(1, "saturates").unwrap();
        assert_eq!(meter.consumed(), u64::MAX);
        assert_eq!(meter.limit(), None);
    }

    #[test]
    fn test_limit_exceeded() {
        let mut meter = GasMeter::with_limit(100);
        meter.consume(60, "read").unwrap();
        assert_eq!(meter.remaining(), 40);

        let err = meter.consume(50, "write").unwrap_err();
        match err {
            Error::OutOfGas {
                descriptor,
                limit,
                consumed,
            } => {
                assert_eq!(descriptor, "write");
                assert_eq!(limit, 100);
                assert_eq!(consumed, 110);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(meter.is_exhausted());
    }

    #[test]
    fn test_exact_limit_allowed() {
        let mut meter = GasMeter::with_limit(100);
        meter.consume(100, "exact").unwrap();
        assert!(!meter.is_exhausted());
        assert_eq!(meter.remaining(), 0);
    }

    #[test]
    fn test_refund() {
        let mut meter = GasMeter::with_limit(100);
        meter.consume(30, "op").unwrap();
        meter.refund(50);
        assert_eq!(meter.consumed(), 0);
    }
}
