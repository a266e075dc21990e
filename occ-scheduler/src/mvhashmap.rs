//! Multi-version hashmap for storing versioned writes of a batch.
//!
//! For each key it keeps one entry per writing transaction. An entry is either
//! the committed value of that transaction or an estimate: a marker that the
//! transaction wrote the key speculatively and has not committed yet. Readers
//! see the entry of the highest transaction below them.

use crate::types::{Incarnation, ReadOrigin, TxnIndex, Version};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Content of a versioned entry.
#[derive(Debug, Clone)]
pub enum EntryCell<V> {
    /// Written by an uncommitted execution; readers must wait.
    Estimate,
    /// Committed value (`None` is a committed delete).
    Committed(Option<V>),
}

/// Entry in the version history for a key.
#[derive(Debug, Clone)]
pub struct VersionedEntry<V> {
    pub incarnation: Incarnation,
    pub cell: EntryCell<V>,
}

/// Multi-version hashmap.
///
/// Structure: K -> BTreeMap<TxnIndex -> VersionedEntry>
///
/// The BTreeMap is keyed by TxnIndex for efficient range queries to find
/// the latest version written by a transaction with index < reader index.
pub struct MVHashMap<K, V> {
    data: DashMap<K, BTreeMap<TxnIndex, VersionedEntry<V>>>,
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<V> {
    /// Committed value of a lower transaction.
    Versioned(Version, Option<V>),
    /// No lower transaction wrote the key, read from base storage.
    Storage,
    /// A lower transaction wrote the key but has not committed.
    Dependency(TxnIndex),
}

impl<V> ReadResult<V> {
    /// The origin this result would be recorded under, if it is readable.
    pub fn origin(&self) -> Option<ReadOrigin> {
        match self {
            ReadResult::Versioned(version, _) => Some(ReadOrigin::Versioned(*version)),
            ReadResult::Storage => Some(ReadOrigin::Storage),
            ReadResult::Dependency(_) => None,
        }
    }
}

impl<K, V> Default for MVHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            data: DashMap::new(),
        }
    }
}

impl<K, V> MVHashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new empty multi-version hashmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the latest version of `key` visible to `reader_txn_idx`.
    pub fn read(&self, key: &K, reader_txn_idx: TxnIndex) -> ReadResult<V> {
        let Some(versions) = self.data.get(key) else {
            return ReadResult::Storage;
        };

        match versions.range(..reader_txn_idx).next_back() {
            Some((&writer, entry)) => match &entry.cell {
                EntryCell::Estimate => ReadResult::Dependency(writer),
                EntryCell::Committed(value) => {
                    ReadResult::Versioned(Version::new(writer, entry.incarnation), value.clone())
                }
            },
            None => ReadResult::Storage,
        }
    }

    /// Publishes estimates for every key `txn_idx` wrote in this incarnation.
    ///
    /// Estimates left behind by an earlier incarnation for keys that are no
    /// longer written are removed, so readers stop waiting on them.
    pub fn mark_estimates<'a, I>(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        previous: I,
        current: &[K],
    ) where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in previous {
            if !current.contains(key) {
                self.remove(key, txn_idx);
            }
        }
        for key in current {
            self.data.entry(key.clone()).or_default().insert(
                txn_idx,
                VersionedEntry {
                    incarnation,
                    cell: EntryCell::Estimate,
                },
            );
        }
    }

    /// Replaces the entry of `txn_idx` at `key` with its committed value.
    pub fn commit(&self, key: K, txn_idx: TxnIndex, incarnation: Incarnation, value: Option<V>) {
        self.data.entry(key).or_default().insert(
            txn_idx,
            VersionedEntry {
                incarnation,
                cell: EntryCell::Committed(value),
            },
        );
    }

    /// Removes the entry written by `txn_idx` at `key`.
    pub fn remove(&self, key: &K, txn_idx: TxnIndex) {
        if let Some(mut versions) = self.data.get_mut(key) {
            versions.remove(&txn_idx);
        }
    }

    /// Number of keys with at least one versioned entry.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
