//! Gas metering.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gas charged for store access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvGasConfig {
    pub has_cost: u64,
    pub delete_cost: u64,
    pub read_cost_flat: u64,
    pub read_cost_per_byte: u64,
    pub write_cost_flat: u64,
    pub write_cost_per_byte: u64,
}

impl Default for KvGasConfig {
    fn default() -> Self {
        Self {
            has_cost: 1000,
            delete_cost: 1000,
            read_cost_flat: 1000,
            read_cost_per_byte: 3,
            write_cost_flat: 2000,
            write_cost_per_byte: 30,
        }
    }
}

#[derive(Debug)]
struct Meter {
    limit: Option<u64>,
    consumed: AtomicU64,
}

/// Shared gas meter. Clones observe the same counter.
#[derive(Debug, Clone)]
pub struct GasMeter(Arc<Meter>);

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self(Arc::new(Meter {
            limit: Some(limit),
            consumed: AtomicU64::new(0),
        }))
    }

    /// Meter that never runs out; reports a limit of zero.
    pub fn infinite() -> Self {
        Self(Arc::new(Meter {
            limit: None,
            consumed: AtomicU64::new(0),
        }))
    }

    pub fn limit(&self) -> u64 {
        self.0.limit.unwrap_or(0)
    }

    pub fn consumed(&self) -> u64 {
        self.0.consumed.load(Ordering::Acquire)
    }

    pub fn is_out_of_gas(&self) -> bool {
        self.0.limit.is_some_and(|limit| self.consumed() > limit)
    }

    /// Charges `amount`, failing once the limit is exceeded.
    pub fn consume_gas(&self, amount: u64, descriptor: &str) -> Result<()> {
        let previous = self
            .0
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                Some(consumed.saturating_add(amount))
            })
            .unwrap_or_else(|consumed| consumed);
        let consumed = previous.saturating_add(amount);
        match self.0.limit {
            Some(limit) if consumed > limit => Err(Error::GasExhausted {
                descriptor: descriptor.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn refund_gas(&self, amount: u64) {
        let _ = self
            .0
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                Some(consumed.saturating_sub(amount))
            });
    }
}
