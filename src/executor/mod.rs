//! Transaction batch execution strategies.
//!
//! This module provides the [`BatchExecutor`] trait and its two
//! implementations: [`SequentialExecutor`] runs the pipeline in index order
//! directly against the Deliver branch, [`OccExecutor`] runs it speculatively
//! on worker threads and commits results in index order.

mod occ;
mod sequential;

pub use occ::OccExecutor;
pub use sequential::SequentialExecutor;

use crate::app::types::ResponseDeliverTx;
use crate::config::AppConfig;
use crate::context::Context;
use crate::error::Result;
use crate::pipeline::TxRunner;
use crate::tx::TxEntry;
use std::time::Duration;

/// Statistics of one executed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub txs: usize,
    pub workers: usize,
    /// Pipeline runs, including re-executions.
    pub executions: usize,
    pub retries: usize,
    pub max_incarnation: usize,
    pub duration: Duration,
}

/// Result of executing a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// One response per entry, in entry order.
    pub responses: Vec<ResponseDeliverTx>,
    pub stats: BatchStats,
}

impl BatchOutput {
    /// Number of transactions that succeeded.
    pub fn successful(&self) -> usize {
        self.responses.iter().filter(|r| r.is_ok()).count()
    }

    /// Number of transactions that failed.
    pub fn failed(&self) -> usize {
        self.responses.len() - self.successful()
    }
}

/// Strategy for delivering an ordered batch of transactions.
///
/// Every implementation must leave `deliver` in the state sequential in-order
/// execution of `entries` would produce, and return responses in entry order.
///
/// # Implementing a New Executor
///
/// ```ignore
/// use occ_baseapp::executor::{BatchExecutor, BatchOutput};
///
/// pub struct ReverseChecker;
///
/// impl BatchExecutor for ReverseChecker {
///     fn execute(
///         &self,
///         runner: &TxRunner,
///         deliver: &mut Context,
///         entries: &[TxEntry],
///     ) -> Result<BatchOutput> {
///         // Your implementation here
///         todo!()
///     }
/// }
/// ```
pub trait BatchExecutor: Send + Sync {
    /// Executes `entries` against the Deliver context.
    fn execute(&self, runner: &TxRunner, deliver: &mut Context, entries: &[TxEntry]) -> Result<BatchOutput>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Picks the executor the configuration asks for.
pub fn from_config(config: &AppConfig) -> Box<dyn BatchExecutor> {
    if config.runs_parallel() {
        Box::new(OccExecutor::new(config.concurrency_workers, config.max_incarnations))
    } else {
        Box::new(SequentialExecutor::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = AppConfig::default();
        assert_eq!(from_config(&config).name(), "occ");

        let config = AppConfig {
            occ_enabled: false,
            ..AppConfig::default()
        };
        assert_eq!(from_config(&config).name(), "sequential");

        let config = AppConfig {
            concurrency_workers: 1,
            ..AppConfig::default()
        };
        assert_eq!(from_config(&config).name(), "sequential");
    }
}
