//! Optimistic parallel batch executor.
//!
//! Plugs the transaction pipeline into [`occ_scheduler::ParallelExecutor`].
//! Each incarnation runs against a private branch whose reads go through the
//! scheduler's multi-version view; its buffered writes become the write set
//! the scheduler validates and commits in index order. Committed write sets
//! are then applied to the Deliver branch in the same order.

use super::{BatchExecutor, BatchOutput, BatchStats};
use crate::app::types::ResponseDeliverTx;
use crate::context::Context;
use crate::error::Result;
use crate::pipeline::TxRunner;
use crate::store::{CacheMultiStore, KeyPath, StoreError, StoreKey, StoreReader};
use crate::tx::TxEntry;
use occ_scheduler::{
    ExecutionResult, ExecutorConfig, Incarnation, ParallelExecutor, ReadError, Storage, StorageError,
    TransactionExecutor, TxnIndex, VersionedView,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Block-level OCC executor.
#[derive(Debug)]
pub struct OccExecutor {
    workers: usize,
    max_incarnations: usize,
}

impl OccExecutor {
    pub fn new(workers: usize, max_incarnations: usize) -> Self {
        Self {
            workers,
            max_incarnations,
        }
    }
}

/// Deliver state as of the start of the batch.
struct BaseState(Arc<dyn StoreReader>);

impl Storage<KeyPath, Vec<u8>> for BaseState {
    fn get(&self, (store, key): &KeyPath) -> Result<Option<Vec<u8>>, StorageError> {
        self.0.get(store, key).map_err(|err| {
            warn!(store = %store, key = %hex::encode(key), %err, "base read failed");
            err.into()
        })
    }
}

/// Adapts a scheduler view to the store layer.
struct MvReader(Arc<VersionedView<KeyPath, Vec<u8>>>);

impl StoreReader for MvReader {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.0
            .read(&(store.clone(), key.to_vec()))
            .map_err(|err| match err {
                ReadError::Dependency(dependency) => StoreError::Dependency(dependency),
                // A base failure carries the reader's own error.
                ReadError::Storage(err) => match err.downcast::<StoreError>() {
                    Ok(err) => *err,
                    Err(err) => StoreError::Backend(err.to_string()),
                },
            })
    }
}

struct DeliverTxExecutor<'a> {
    runner: &'a TxRunner,
    block: &'a Context,
    entries: &'a [TxEntry],
    stores: Arc<BTreeSet<StoreKey>>,
}

impl TransactionExecutor for DeliverTxExecutor<'_> {
    type Key = KeyPath;
    type Value = Vec<u8>;
    type Output = ResponseDeliverTx;

    fn execute(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        view: Arc<VersionedView<KeyPath, Vec<u8>>>,
    ) -> ExecutionResult<KeyPath, Vec<u8>, ResponseDeliverTx> {
        let ms = CacheMultiStore::new(Arc::new(MvReader(view.clone())), self.stores.clone(), 0);
        let mut ctx = self.block.derive(ms);
        let response = self.runner.deliver_tx(&mut ctx, &self.entries[txn_idx]);

        if let Some(dependency) = view.dependency() {
            tracing::trace!(txn_idx, incarnation, dependency, "speculative execution aborted");
            return ExecutionResult::Abort { dependency };
        }

        ExecutionResult::Success {
            write_set: ctx.into_store().into_write_set(),
            output: response,
        }
    }
}

impl BatchExecutor for OccExecutor {
    fn execute(&self, runner: &TxRunner, deliver: &mut Context, entries: &[TxEntry]) -> Result<BatchOutput> {
        if entries.is_empty() {
            return Ok(BatchOutput::default());
        }

        let executor = ParallelExecutor::new(ExecutorConfig {
            num_threads: self.workers,
            max_incarnations: self.max_incarnations,
        });
        let block = DeliverTxExecutor {
            runner,
            block: deliver,
            entries,
            stores: deliver.store().mounted(),
        };
        let base: Arc<dyn Storage<KeyPath, Vec<u8>>> = Arc::new(BaseState(deliver.store().freeze()));
        let output = executor.execute_block(entries.len(), base, &block);

        for write_set in output.write_sets {
            deliver.store_mut().apply_write_set(write_set);
        }
        deliver.store().reset_events();
        for (entry, response) in entries.iter().zip(&output.outputs) {
            runner.run_deliver_hooks(deliver, entry, response);
        }

        let stats = BatchStats {
            txs: output.stats.num_txns,
            workers: output.stats.workers,
            executions: output.stats.executions,
            retries: output.stats.retries,
            max_incarnation: output.stats.max_incarnation,
            duration: output.stats.duration,
        };
        info!(
            height = deliver.block_height(),
            txs = stats.txs,
            latency_ms = stats.duration.as_millis() as u64,
            retries = stats.retries,
            max_incarnation = stats.max_incarnation,
            workers = stats.workers,
            "occ scheduler"
        );

        Ok(BatchOutput {
            responses: output.outputs,
            stats,
        })
    }

    fn name(&self) -> &'static str {
        "occ"
    }
}
