//! Branching key/value state.
//!
//! State is addressed by a [`StoreKey`] naming a substore plus a raw key. The
//! root [`CommitMultiStore`] holds committed versions; [`CacheMultiStore`]
//! branches sit on top of it (or on top of each other) and buffer writes until
//! they are merged into their parent.

mod cache;
mod commit;

pub use cache::{CacheMultiStore, KeyPath, WriteSet};
pub use commit::{CommitId, CommitMultiStore, MemCommitStore};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of a mounted substore.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Arc<str>);

impl StoreKey {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({})", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store {0} is not mounted")]
    UnknownStore(String),
    /// Branch was taken from an older state of its parent.
    #[error("branch is stale: parent generation {expected}, branch taken at {found}")]
    StaleBranch { expected: u64, found: u64 },
    /// Speculative read hit an uncommitted write of a lower transaction.
    #[error("read depends on uncommitted transaction {0}")]
    Dependency(usize),
    #[error("version {0} does not exist")]
    VersionNotFound(i64),
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Point reads against some layer of state.
pub trait StoreReader: Send + Sync {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Kind of an observed state access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

/// State access observed through a branch, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub mode: AccessMode,
    pub store: StoreKey,
    pub key: Vec<u8>,
}

/// Key/value pairs attached to the store for trace logging.
pub type TraceContext = BTreeMap<String, String>;
