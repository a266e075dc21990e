//! Core types for optimistic execution.

use std::fmt;

/// Transaction index in the batch (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Ordered writes of one transaction. `None` deletes the key.
pub type WriteSet<K, V> = Vec<(K, Option<V>)>;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// Where a speculative read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
    /// Committed write of a lower transaction in the same batch.
    Versioned(Version),
    /// Base storage underneath the batch.
    Storage,
}

/// A single recorded read, replayed during validation.
#[derive(Debug, Clone)]
pub struct ReadDescriptor<K> {
    pub key: K,
    pub origin: ReadOrigin,
}

/// Result of one execution attempt.
#[derive(Debug)]
pub enum ExecutionResult<K, V, O> {
    /// The transaction ran to completion (its own logic may still have failed,
    /// which is part of `output`).
    Success { write_set: WriteSet<K, V>, output: O },
    /// The transaction read an estimate and must wait for `dependency`.
    Abort { dependency: TxnIndex },
}

/// Status of a transaction in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Queued for execution.
    Pending(Incarnation),
    /// Currently executing.
    Executing(Incarnation),
    /// Finished execution, waiting for the commit frontier.
    Executed(Incarnation),
    /// Parked until a lower transaction commits; runs next at this incarnation.
    Waiting(Incarnation),
    /// Failed validation; queued again at this incarnation.
    Aborted(Incarnation),
    /// Committed to final state.
    Committed,
}
