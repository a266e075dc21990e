//! Optimistic concurrency control scheduler for block transactions.
//!
//! This crate runs a batch of transactions speculatively on a pool of worker
//! threads and produces the same final state as executing them one after the
//! other in index order. It knows nothing about what a transaction does: the
//! caller supplies a [`TransactionExecutor`] that runs one transaction against a
//! [`VersionedView`] and returns its write set.
//!
//! # Core Components
//!
//! - **MVHashMap**: Multi-version data structure holding committed writes and
//!   estimates of in-flight writes, keyed by transaction index
//! - **Scheduler**: Ready queue, per-transaction status, dependency wake-ups and
//!   the in-order commit frontier
//! - **ParallelExecutor**: Worker pool that executes, validates and commits
//!
//! # Algorithm Overview
//!
//! 1. Every transaction is executed speculatively, recording the version of
//!    every key it reads
//! 2. On finishing, its written keys are published as estimates so higher
//!    transactions reading them abort and wait instead of reading stale data
//! 3. Reading an estimate aborts the reader, which is parked until the writer
//!    commits
//! 4. The lowest uncommitted transaction is validated: if every recorded read
//!    still resolves to the same version it commits, otherwise it is
//!    re-executed with a higher incarnation
//! 5. A transaction that keeps being invalidated is only re-run once it is at
//!    the commit frontier, where it cannot conflict any more
//!
//! # Example
//!
//! ```rust,ignore
//! use occ_scheduler::{ExecutorConfig, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(ExecutorConfig {
//!     num_threads: 4,
//!     max_incarnations: 10,
//! });
//! let output = executor.execute_block(txs.len(), storage, &my_executor);
//!
//! println!("retries: {}", output.stats.retries);
//! ```

pub mod executor;
pub mod mvhashmap;
pub mod scheduler;
pub mod types;

pub use executor::{
    BlockOutput, BlockStats, ExecutorConfig, ParallelExecutor, ReadError, Storage, StorageError,
    TransactionExecutor, VersionedView,
};
pub use types::{ExecutionResult, Incarnation, ReadOrigin, TxnIndex, Version, WriteSet};
