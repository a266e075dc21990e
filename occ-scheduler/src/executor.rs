//! Parallel executor driving the scheduler with a pool of worker threads.

use crate::mvhashmap::{MVHashMap, ReadResult};
use crate::scheduler::{Scheduler, Task, Validation};
use crate::types::{
    ExecutionResult, Incarnation, ReadDescriptor, ReadOrigin, TxnIndex, WriteSet,
};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Failure reported by [`Storage`].
pub type StorageError = Box<dyn std::error::Error + Send + Sync>;

/// Base state underneath a batch.
pub trait Storage<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>, StorageError>;
}

/// Why a [`VersionedView`] read did not produce a value.
#[derive(Debug)]
pub enum ReadError {
    /// A lower transaction has an uncommitted write to the key.
    Dependency(TxnIndex),
    /// The base storage failed. Surfaced to the executor as is.
    Storage(StorageError),
}

/// Executes one transaction of a batch.
///
/// Implementations must read all state through the supplied view and must not
/// have side effects outside the returned write set: an execution may be
/// discarded and repeated any number of times.
pub trait TransactionExecutor: Sync {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;
    type Output: Send;

    fn execute(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        view: Arc<VersionedView<Self::Key, Self::Value>>,
    ) -> ExecutionResult<Self::Key, Self::Value, Self::Output>;
}

/// Read-only view of the batch state as seen by one transaction.
///
/// Every read that reaches a version or the base storage is recorded for
/// validation. Reading a key that a lower transaction wrote but has not
/// committed returns that transaction's index as an error, and the execution
/// is treated as aborted even if the executor swallows the error.
pub struct VersionedView<K, V> {
    txn_idx: TxnIndex,
    mv: Arc<MVHashMap<K, V>>,
    base: Arc<dyn Storage<K, V>>,
    reads: Mutex<Vec<ReadDescriptor<K>>>,
    dependency: Mutex<Option<TxnIndex>>,
}

impl<K, V> VersionedView<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn new(txn_idx: TxnIndex, mv: Arc<MVHashMap<K, V>>, base: Arc<dyn Storage<K, V>>) -> Self {
        Self {
            txn_idx,
            mv,
            base,
            reads: Mutex::new(Vec::new()),
            dependency: Mutex::new(None),
        }
    }

    /// Index of the transaction this view belongs to.
    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    /// Reads `key`, or returns the index of the transaction to wait for.
    pub fn read(&self, key: &K) -> Result<Option<V>, ReadError> {
        match self.mv.read(key, self.txn_idx) {
            ReadResult::Versioned(version, value) => {
                self.record(key, ReadOrigin::Versioned(version));
                Ok(value)
            }
            ReadResult::Storage => {
                self.record(key, ReadOrigin::Storage);
                self.base.get(key).map_err(ReadError::Storage)
            }
            ReadResult::Dependency(dependency) => {
                self.dependency.lock().get_or_insert(dependency);
                Err(ReadError::Dependency(dependency))
            }
        }
    }

    /// First dependency hit during this execution.
    pub fn dependency(&self) -> Option<TxnIndex> {
        *self.dependency.lock()
    }

    fn record(&self, key: &K, origin: ReadOrigin) {
        self.reads.lock().push(ReadDescriptor {
            key: key.clone(),
            origin,
        });
    }

    fn take_reads(&self) -> Vec<ReadDescriptor<K>> {
        std::mem::take(&mut *self.reads.lock())
    }
}

/// Configuration for the parallel executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads. Zero or one executes on the calling thread.
    pub num_threads: usize,
    /// Incarnation from which a transaction only re-runs at the commit frontier.
    pub max_incarnations: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_incarnations: 10,
        }
    }
}

/// Statistics of one batch.
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
    pub num_txns: usize,
    pub workers: usize,
    pub executions: usize,
    pub retries: usize,
    pub max_incarnation: usize,
    pub duration: Duration,
}

/// Committed results of a batch, in transaction index order.
#[derive(Debug)]
pub struct BlockOutput<K, V, O> {
    pub outputs: Vec<O>,
    pub write_sets: Vec<WriteSet<K, V>>,
    pub stats: BlockStats,
}

/// Parallel optimistic executor.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

struct Slot<K, V, O> {
    incarnation: Incarnation,
    reads: Vec<ReadDescriptor<K>>,
    write_set: WriteSet<K, V>,
    output: O,
}

/// Shared state of one batch run.
struct BlockRun<'a, E: TransactionExecutor> {
    executor: &'a E,
    scheduler: Arc<Scheduler>,
    mv: Arc<MVHashMap<E::Key, E::Value>>,
    base: Arc<dyn Storage<E::Key, E::Value>>,
    slots: Vec<Mutex<Option<Slot<E::Key, E::Value, E::Output>>>>,
    estimates: Vec<Mutex<Vec<E::Key>>>,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ParallelExecutor {
    /// Creates a new parallel executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `num_txns` transactions and returns their committed results.
    ///
    /// The outcome equals executing transaction 0, then 1, and so on against
    /// `base`. A panic raised by the executor stops every worker and is
    /// resumed on the calling thread.
    pub fn execute_block<E>(
        &self,
        num_txns: usize,
        base: Arc<dyn Storage<E::Key, E::Value>>,
        executor: &E,
    ) -> BlockOutput<E::Key, E::Value, E::Output>
    where
        E: TransactionExecutor,
    {
        let start = Instant::now();
        let workers = self.config.num_threads.max(1).min(num_txns.max(1));

        if num_txns == 0 {
            return BlockOutput {
                outputs: Vec::new(),
                write_sets: Vec::new(),
                stats: BlockStats {
                    workers,
                    ..BlockStats::default()
                },
            };
        }

        let run = BlockRun {
            executor,
            scheduler: Scheduler::new(num_txns, self.config.max_incarnations),
            mv: Arc::new(MVHashMap::new()),
            base,
            slots: (0..num_txns).map(|_| Mutex::new(None)).collect(),
            estimates: (0..num_txns).map(|_| Mutex::new(Vec::new())).collect(),
            panic: Mutex::new(None),
        };

        if workers == 1 {
            run.worker_loop(0);
        } else {
            let scope = crossbeam::thread::scope(|s| {
                for worker_id in 0..workers {
                    let run = &run;
                    s.spawn(move |_| run.worker_loop(worker_id));
                }
            });
            if let Err(payload) = scope {
                panic::resume_unwind(payload);
            }
        }

        if let Some(payload) = run.panic.lock().take() {
            panic::resume_unwind(payload);
        }

        let scheduler_stats = run.scheduler.stats();
        let mut outputs = Vec::with_capacity(num_txns);
        let mut write_sets = Vec::with_capacity(num_txns);
        for slot in run.slots {
            // Every index is committed once the scheduler reports done.
            if let Some(slot) = slot.into_inner() {
                outputs.push(slot.output);
                write_sets.push(slot.write_set);
            }
        }

        let stats = BlockStats {
            num_txns,
            workers,
            executions: scheduler_stats.executions,
            retries: scheduler_stats.retries,
            max_incarnation: scheduler_stats.max_incarnation,
            duration: start.elapsed(),
        };
        tracing::debug!(
            txs = num_txns,
            workers,
            executions = stats.executions,
            retries = stats.retries,
            "parallel batch finished"
        );

        BlockOutput {
            outputs,
            write_sets,
            stats,
        }
    }
}

impl<E: TransactionExecutor> BlockRun<'_, E> {
    /// Worker thread main loop.
    fn worker_loop(&self, worker_id: usize) {
        let backoff = Backoff::new();
        let mut local_executions = 0usize;

        loop {
            match self.scheduler.next_task() {
                Task::Execute(txn_idx, incarnation) => {
                    backoff.reset();
                    local_executions += 1;
                    self.execute(txn_idx, incarnation);
                    self.try_commit();
                }
                Task::Wait => {
                    // A finished transaction may have lost the race for the
                    // commit lock; whoever idles picks the frontier up.
                    self.try_commit();
                    if backoff.is_completed() {
                        thread::sleep(Duration::from_micros(10));
                    } else {
                        backoff.snooze();
                    }
                }
                Task::Done => {
                    tracing::trace!(worker_id, local_executions, "worker done");
                    break;
                }
            }
        }
    }

    fn execute(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let view = Arc::new(VersionedView::new(
            txn_idx,
            self.mv.clone(),
            self.base.clone(),
        ));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute(txn_idx, incarnation, view.clone())
        }));
        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                self.panic.lock().get_or_insert(payload);
                self.scheduler.halt();
                return;
            }
        };

        let reads = view.take_reads();
        let dependency = match (view.dependency(), &result) {
            (Some(dependency), _) => Some(dependency),
            (None, ExecutionResult::Abort { dependency }) => Some(*dependency),
            (None, ExecutionResult::Success { .. }) => None,
        };
        if let Some(dependency) = dependency {
            if dependency < txn_idx {
                self.scheduler
                    .add_dependency(txn_idx, incarnation, dependency);
            } else {
                self.scheduler.retry(txn_idx, incarnation);
            }
            return;
        }

        let ExecutionResult::Success { write_set, output } = result else {
            return;
        };
        let keys: Vec<E::Key> = write_set.iter().map(|(key, _)| key.clone()).collect();
        {
            let mut previous = self.estimates[txn_idx].lock();
            self.mv
                .mark_estimates(txn_idx, incarnation, previous.iter(), &keys);
            *previous = keys;
        }
        *self.slots[txn_idx].lock() = Some(Slot {
            incarnation,
            reads,
            write_set,
            output,
        });
        self.scheduler.finish_execution(txn_idx, incarnation);
    }

    fn try_commit(&self) {
        self.scheduler.try_commit(|txn_idx, incarnation| {
            let slot = self.slots[txn_idx].lock();
            let Some(slot) = slot.as_ref() else {
                return Validation::Invalid;
            };
            if slot.incarnation != incarnation {
                return Validation::Invalid;
            }

            let valid = slot
                .reads
                .iter()
                .all(|read| self.mv.read(&read.key, txn_idx).origin() == Some(read.origin));
            if !valid {
                return Validation::Invalid;
            }

            for (key, value) in &slot.write_set {
                self.mv
                    .commit(key.clone(), txn_idx, incarnation, value.clone());
            }
            Validation::Committed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    struct MapStorage(HashMap<u32, u64>);

    impl Storage<u32, u64> for MapStorage {
        fn get(&self, key: &u32) -> Result<Option<u64>, StorageError> {
            Ok(self.0.get(key).copied())
        }
    }

    /// Each transaction moves one unit from `from` to `to`, if it can.
    struct Transfers {
        txs: Vec<(u32, u32)>,
    }

    impl TransactionExecutor for Transfers {
        type Key = u32;
        type Value = u64;
        type Output = bool;

        fn execute(
            &self,
            txn_idx: TxnIndex,
            _incarnation: Incarnation,
            view: Arc<VersionedView<u32, u64>>,
        ) -> ExecutionResult<u32, u64, bool> {
            let (from, to) = self.txs[txn_idx];
            let from_balance = match view.read(&from) {
                Ok(balance) => balance.unwrap_or(0),
                Err(ReadError::Dependency(dependency)) => return ExecutionResult::Abort { dependency },
                Err(ReadError::Storage(err)) => panic!("{err}"),
            };
            if from_balance == 0 {
                return ExecutionResult::Success {
                    write_set: Vec::new(),
                    output: false,
                };
            }
            let to_balance = match view.read(&to) {
                Ok(balance) => balance.unwrap_or(0),
                Err(ReadError::Dependency(dependency)) => return ExecutionResult::Abort { dependency },
                Err(ReadError::Storage(err)) => panic!("{err}"),
            };
            ExecutionResult::Success {
                write_set: vec![(from, Some(from_balance - 1)), (to, Some(to_balance + 1))],
                output: true,
            }
        }
    }

    fn sequential(txs: &[(u32, u32)], mut state: HashMap<u32, u64>) -> (HashMap<u32, u64>, Vec<bool>) {
        let mut outputs = Vec::new();
        for &(from, to) in txs {
            let from_balance = state.get(&from).copied().unwrap_or(0);
            if from_balance == 0 {
                outputs.push(false);
                continue;
            }
            let to_balance = state.get(&to).copied().unwrap_or(0);
            state.insert(from, from_balance - 1);
            state.insert(to, to_balance + 1);
            outputs.push(true);
        }
        (state, outputs)
    }

    fn run_parallel(
        txs: Vec<(u32, u32)>,
        genesis: HashMap<u32, u64>,
        num_threads: usize,
        max_incarnations: usize,
    ) -> (HashMap<u32, u64>, Vec<bool>, BlockStats) {
        let executor = ParallelExecutor::new(ExecutorConfig {
            num_threads,
            max_incarnations,
        });
        let workload = Transfers { txs };
        let output =
            executor.execute_block(workload.txs.len(), Arc::new(MapStorage(genesis.clone())), &workload);

        let mut state = genesis;
        for write_set in output.write_sets {
            for (key, value) in write_set {
                match value {
                    Some(value) => state.insert(key, value),
                    None => state.remove(&key),
                };
            }
        }
        (state, output.outputs, output.stats)
    }

    fn random_workload(seed: u64, num_txns: usize, accounts: u32) -> (Vec<(u32, u32)>, HashMap<u32, u64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let txs = (0..num_txns)
            .map(|_| {
                let from = rng.gen_range(0..accounts);
                let to = (from + rng.gen_range(1..accounts)) % accounts;
                (from, to)
            })
            .collect();
        let genesis = (0..accounts).map(|a| (a, rng.gen_range(0..3))).collect();
        (txs, genesis)
    }

    #[test]
    fn test_empty_batch() {
        let (state, outputs, stats) = run_parallel(Vec::new(), HashMap::new(), 4, 10);
        assert!(state.is_empty());
        assert!(outputs.is_empty());
        assert_eq!(stats.executions, 0);
    }

    #[test]
    fn test_matches_sequential_under_contention() {
        for seed in 0..8 {
            let (txs, genesis) = random_workload(seed, 200, 5);
            let (expected_state, expected_outputs) = sequential(&txs, genesis.clone());

            let (state, outputs, stats) = run_parallel(txs, genesis, 4, 10);
            assert_eq!(state, expected_state, "seed {seed}");
            assert_eq!(outputs, expected_outputs, "seed {seed}");
            assert!(stats.executions >= 200);
        }
    }

    #[test]
    fn test_single_worker_is_sequential() {
        let (txs, genesis) = random_workload(42, 50, 3);
        let (expected_state, _) = sequential(&txs, genesis.clone());

        let (state, _, stats) = run_parallel(txs, genesis, 1, 10);
        assert_eq!(state, expected_state);
        assert_eq!(stats.workers, 1);
    }

    #[test]
    fn test_low_incarnation_limit_still_converges() {
        let (txs, genesis) = random_workload(7, 100, 2);
        let (expected_state, _) = sequential(&txs, genesis.clone());

        let (state, _, _) = run_parallel(txs, genesis, 8, 1);
        assert_eq!(state, expected_state);
    }

    #[test]
    fn test_independent_transactions_commit_without_retry() {
        let txs: Vec<(u32, u32)> = (0..16).map(|i| (2 * i, 2 * i + 1)).collect();
        let genesis = (0..32).map(|a| (a, 1)).collect::<HashMap<_, _>>();
        let (expected_state, _) = sequential(&txs, genesis.clone());

        let (state, outputs, stats) = run_parallel(txs, genesis, 4, 10);
        assert_eq!(state, expected_state);
        assert!(outputs.iter().all(|ok| *ok));
        assert_eq!(stats.retries, 0);
    }

    #[test]
    fn test_storage_errors_reach_the_executor() {
        /// Fails every read of key 7.
        struct Flaky;
        impl Storage<u32, u64> for Flaky {
            fn get(&self, key: &u32) -> Result<Option<u64>, StorageError> {
                match key {
                    7 => Err("disk unavailable".into()),
                    _ => Ok(Some(u64::from(*key))),
                }
            }
        }

        /// Reads key `txn_idx`, reporting the outcome.
        struct Reads;
        impl TransactionExecutor for Reads {
            type Key = u32;
            type Value = u64;
            type Output = Result<Option<u64>, String>;

            fn execute(
                &self,
                txn_idx: TxnIndex,
                _incarnation: Incarnation,
                view: Arc<VersionedView<u32, u64>>,
            ) -> ExecutionResult<u32, u64, Self::Output> {
                let output = match view.read(&(txn_idx as u32)) {
                    Ok(value) => Ok(value),
                    Err(ReadError::Dependency(dependency)) => return ExecutionResult::Abort { dependency },
                    Err(ReadError::Storage(err)) => Err(err.to_string()),
                };
                ExecutionResult::Success {
                    write_set: Vec::new(),
                    output,
                }
            }
        }

        let executor = ParallelExecutor::new(ExecutorConfig {
            num_threads: 4,
            max_incarnations: 10,
        });
        let output = executor.execute_block(10, Arc::new(Flaky), &Reads);
        assert_eq!(output.outputs[6], Ok(Some(6)));
        assert_eq!(output.outputs[7], Err("disk unavailable".to_string()));
        assert_eq!(output.outputs[8], Ok(Some(8)));
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_executor_panic_is_resumed() {
        struct Panics;
        impl TransactionExecutor for Panics {
            type Key = u32;
            type Value = u64;
            type Output = ();

            fn execute(
                &self,
                txn_idx: TxnIndex,
                _incarnation: Incarnation,
                _view: Arc<VersionedView<u32, u64>>,
            ) -> ExecutionResult<u32, u64, ()> {
                if txn_idx == 3 {
                    panic!("boom");
                }
                ExecutionResult::Success {
                    write_set: Vec::new(),
                    output: (),
                }
            }
        }

        let executor = ParallelExecutor::new(ExecutorConfig {
            num_threads: 4,
            max_incarnations: 10,
        });
        executor.execute_block(8, Arc::new(MapStorage(HashMap::new())), &Panics);
    }
}
