//! Scheduler coordinating speculative execution and the in-order commit frontier.

use crate::types::{ExecutionStatus, Incarnation, TxnIndex};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Task for a worker thread to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(TxnIndex, Incarnation),
    /// No task currently available, retry later.
    Wait,
    /// All transactions are committed.
    Done,
}

/// Outcome of validating the transaction at the commit frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Reads are still current; the writes were committed.
    Committed,
    /// A read is stale; the transaction must run again.
    Invalid,
}

/// Scheduler state for coordinating parallel execution.
pub struct Scheduler {
    /// Number of transactions in the batch.
    num_txns: usize,

    /// Execution status for each transaction.
    statuses: Vec<RwLock<ExecutionStatus>>,

    /// Queue of transactions ready to execute.
    ready_queue: Mutex<VecDeque<(TxnIndex, Incarnation)>>,

    /// Transactions past the incarnation limit, held until they reach the frontier.
    deferred: Mutex<BTreeMap<TxnIndex, Incarnation>>,

    /// Transactions parked on each index, woken when it commits.
    dependents: Vec<Mutex<Vec<TxnIndex>>>,

    /// Lowest uncommitted transaction index.
    committed_idx: AtomicUsize,

    /// Incarnation from which execution is deferred to the frontier.
    max_incarnations: usize,

    /// Number of execution attempts started.
    executions: AtomicUsize,

    /// Number of re-executions (aborts plus failed validations).
    retries: AtomicUsize,

    /// Highest incarnation started.
    max_incarnation: AtomicUsize,

    /// Whether execution is done.
    done: AtomicBool,

    /// Lock for committing transactions (only one thread can commit at a time).
    commit_lock: Mutex<()>,
}

impl Scheduler {
    /// Creates a new scheduler for a batch of transactions.
    pub fn new(num_txns: usize, max_incarnations: usize) -> Arc<Self> {
        // Initially, all transactions are ready to execute for the first time
        let ready_queue = (0..num_txns).map(|idx| (idx, 0)).collect();

        Arc::new(Self {
            num_txns,
            statuses: (0..num_txns)
                .map(|_| RwLock::new(ExecutionStatus::Pending(0)))
                .collect(),
            ready_queue: Mutex::new(ready_queue),
            deferred: Mutex::new(BTreeMap::new()),
            dependents: (0..num_txns).map(|_| Mutex::new(Vec::new())).collect(),
            committed_idx: AtomicUsize::new(0),
            max_incarnations: max_incarnations.max(1),
            executions: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            max_incarnation: AtomicUsize::new(0),
            done: AtomicBool::new(num_txns == 0),
            commit_lock: Mutex::new(()),
        })
    }

    /// Gets the next task for a worker thread.
    pub fn next_task(&self) -> Task {
        if self.done.load(Ordering::Acquire) {
            return Task::Done;
        }

        loop {
            let next = self.ready_queue.lock().pop_front();
            let Some((txn_idx, incarnation)) = next else {
                break;
            };
            if incarnation >= self.max_incarnations && !self.at_frontier(txn_idx) {
                self.deferred.lock().insert(txn_idx, incarnation);
                continue;
            }
            return self.start(txn_idx, incarnation);
        }

        // A deferred transaction may run once everything below it committed.
        let frontier = self.committed_idx.load(Ordering::Acquire);
        let deferred = self.deferred.lock().remove(&frontier);
        if let Some(incarnation) = deferred {
            return self.start(frontier, incarnation);
        }

        if frontier >= self.num_txns {
            self.done.store(true, Ordering::Release);
            return Task::Done;
        }

        // No task available right now
        Task::Wait
    }

    fn start(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> Task {
        *self.statuses[txn_idx].write() = ExecutionStatus::Executing(incarnation);
        self.executions.fetch_add(1, Ordering::AcqRel);
        self.max_incarnation.fetch_max(incarnation, Ordering::AcqRel);
        Task::Execute(txn_idx, incarnation)
    }

    fn at_frontier(&self, txn_idx: TxnIndex) -> bool {
        self.committed_idx.load(Ordering::Acquire) == txn_idx
    }

    /// Marks a transaction as executed. The caller then attempts a commit.
    pub fn finish_execution(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        *self.statuses[txn_idx].write() = ExecutionStatus::Executed(incarnation);
    }

    /// Parks `txn_idx` until `dependency` commits.
    ///
    /// If the dependency already committed in the meantime the transaction is
    /// queued again straight away.
    pub fn add_dependency(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        dependency: TxnIndex,
    ) {
        let next = incarnation + 1;
        self.retries.fetch_add(1, Ordering::AcqRel);

        // The committer flips the status before draining, so holding this lock
        // while checking the status cannot miss a wake-up.
        let mut waiters = self.dependents[dependency].lock();
        if matches!(*self.statuses[dependency].read(), ExecutionStatus::Committed) {
            drop(waiters);
            *self.statuses[txn_idx].write() = ExecutionStatus::Pending(next);
            self.ready_queue.lock().push_back((txn_idx, next));
            return;
        }
        *self.statuses[txn_idx].write() = ExecutionStatus::Waiting(next);
        waiters.push(txn_idx);
    }

    /// Queues a transaction again without a dependency to wait for.
    pub fn retry(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let next = incarnation + 1;
        self.retries.fetch_add(1, Ordering::AcqRel);
        *self.statuses[txn_idx].write() = ExecutionStatus::Pending(next);
        self.ready_queue.lock().push_back((txn_idx, next));
    }

    /// Stops handing out work; every worker receives [`Task::Done`] next.
    pub fn halt(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Schedules a transaction that failed validation for re-execution.
    fn abort_transaction(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let next = incarnation + 1;
        self.retries.fetch_add(1, Ordering::AcqRel);
        *self.statuses[txn_idx].write() = ExecutionStatus::Aborted(next);
        // The frontier transaction goes first; nothing else can commit before it.
        self.ready_queue.lock().push_front((txn_idx, next));
    }

    /// Commits transactions in index order while they validate.
    ///
    /// `validate_and_commit` is invoked for the frontier transaction under the
    /// commit lock; it must apply the writes when it returns
    /// [`Validation::Committed`]. Returns without doing anything if another
    /// thread holds the lock.
    pub fn try_commit<F>(&self, mut validate_and_commit: F)
    where
        F: FnMut(TxnIndex, Incarnation) -> Validation,
    {
        let Some(_guard) = self.commit_lock.try_lock() else {
            return;
        };

        let mut committed_idx = self.committed_idx.load(Ordering::Acquire);
        while committed_idx < self.num_txns {
            let status = *self.statuses[committed_idx].read();
            let ExecutionStatus::Executed(incarnation) = status else {
                break;
            };

            match validate_and_commit(committed_idx, incarnation) {
                Validation::Committed => {
                    *self.statuses[committed_idx].write() = ExecutionStatus::Committed;
                    let woken = std::mem::take(&mut *self.dependents[committed_idx].lock());
                    committed_idx += 1;
                    self.committed_idx.store(committed_idx, Ordering::Release);
                    self.wake(woken);
                }
                Validation::Invalid => {
                    tracing::debug!(
                        txn_idx = committed_idx,
                        incarnation,
                        "validation failed, re-executing"
                    );
                    self.abort_transaction(committed_idx, incarnation);
                    break;
                }
            }
        }

        if committed_idx >= self.num_txns {
            self.done.store(true, Ordering::Release);
        }
    }

    fn wake(&self, woken: Vec<TxnIndex>) {
        if woken.is_empty() {
            return;
        }
        let mut queue = self.ready_queue.lock();
        for txn_idx in woken {
            let mut status = self.statuses[txn_idx].write();
            if let ExecutionStatus::Waiting(incarnation) = *status {
                *status = ExecutionStatus::Pending(incarnation);
                queue.push_back((txn_idx, incarnation));
            }
        }
    }

    /// Checks if a transaction has been committed.
    pub fn is_committed(&self, txn_idx: TxnIndex) -> bool {
        matches!(*self.statuses[txn_idx].read(), ExecutionStatus::Committed)
    }

    /// Gets the current status of a transaction.
    pub fn get_status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        *self.statuses[txn_idx].read()
    }

    /// Checks if all transactions are done.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            committed: self.committed_idx.load(Ordering::Acquire),
            executions: self.executions.load(Ordering::Acquire),
            retries: self.retries.load(Ordering::Acquire),
            max_incarnation: self.max_incarnation.load(Ordering::Acquire),
        }
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub committed: usize,
    pub executions: usize,
    pub retries: usize,
    pub max_incarnation: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_execute(scheduler: &Scheduler) -> (TxnIndex, Incarnation) {
        match scheduler.next_task() {
            Task::Execute(idx, inc) => (idx, inc),
            other => panic!("Expected Execute task, got {other:?}"),
        }
    }

    #[test]
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new(3, 10);

        assert_eq!(expect_execute(&scheduler), (0, 0));
        assert_eq!(expect_execute(&scheduler), (1, 0));
        assert_eq!(expect_execute(&scheduler), (2, 0));
        assert_eq!(scheduler.next_task(), Task::Wait);
    }

    #[test]
    fn test_commits_in_order() {
        let scheduler = Scheduler::new(2, 10);
        let _ = expect_execute(&scheduler);
        let _ = expect_execute(&scheduler);

        // Transaction 1 finishes first but cannot commit past 0.
        scheduler.finish_execution(1, 0);
        scheduler.try_commit(|_, _| Validation::Committed);
        assert!(!scheduler.is_committed(1));

        scheduler.finish_execution(0, 0);
        let mut order = Vec::new();
        scheduler.try_commit(|idx, _| {
            order.push(idx);
            Validation::Committed
        });
        assert_eq!(order, vec![0, 1]);
        assert!(scheduler.is_done());
        assert_eq!(scheduler.next_task(), Task::Done);
    }

    #[test]
    fn test_invalid_reexecutes() {
        let scheduler = Scheduler::new(2, 10);
        let _ = expect_execute(&scheduler);
        let _ = expect_execute(&scheduler);
        scheduler.finish_execution(0, 0);
        scheduler.finish_execution(1, 0);

        scheduler.try_commit(|idx, _| {
            if idx == 0 {
                Validation::Committed
            } else {
                Validation::Invalid
            }
        });

        assert_eq!(scheduler.get_status(1), ExecutionStatus::Aborted(1));
        assert_eq!(expect_execute(&scheduler), (1, 1));
        assert_eq!(scheduler.stats().retries, 1);
    }

    #[test]
    fn test_dependency_wakes_on_commit() {
        let scheduler = Scheduler::new(2, 10);
        let _ = expect_execute(&scheduler);
        let _ = expect_execute(&scheduler);

        scheduler.add_dependency(1, 0, 0);
        assert_eq!(scheduler.get_status(1), ExecutionStatus::Waiting(1));
        assert_eq!(scheduler.next_task(), Task::Wait);

        scheduler.finish_execution(0, 0);
        scheduler.try_commit(|_, _| Validation::Committed);
        assert_eq!(expect_execute(&scheduler), (1, 1));
    }

    #[test]
    fn test_dependency_on_committed_requeues() {
        let scheduler = Scheduler::new(2, 10);
        let _ = expect_execute(&scheduler);
        let _ = expect_execute(&scheduler);
        scheduler.finish_execution(0, 0);
        scheduler.try_commit(|_, _| Validation::Committed);

        scheduler.add_dependency(1, 0, 0);
        assert_eq!(expect_execute(&scheduler), (1, 1));
    }

    #[test]
    fn test_incarnation_limit_defers_to_frontier() {
        let scheduler = Scheduler::new(2, 1);
        let _ = expect_execute(&scheduler);
        let _ = expect_execute(&scheduler);

        // Transaction 1 reached the limit while 0 is still running.
        scheduler.add_dependency(1, 0, 0);
        scheduler.finish_execution(0, 0);
        // Pretend the wake-up happened without the frontier moving.
        scheduler.ready_queue.lock().push_back((1, 1));
        *scheduler.statuses[1].write() = ExecutionStatus::Pending(1);
        assert_eq!(scheduler.next_task(), Task::Wait);

        scheduler.try_commit(|_, _| Validation::Committed);
        assert_eq!(expect_execute(&scheduler), (1, 1));
    }
}
