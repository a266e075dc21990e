//! Root store holding committed versions.

use super::cache::{next_generation, CacheMultiStore, KeyPath};
use super::{StoreError, StoreKey, StoreReader, TraceContext};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Height and hash of a committed version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitId {
    pub version: i64,
    pub hash: [u8; 32],
}

impl CommitId {
    pub fn is_zero(&self) -> bool {
        self.version == 0 && self.hash == [0u8; 32]
    }
}

/// Root of the multi-store: versioned, committable state.
pub trait CommitMultiStore: Send + Sync {
    fn mount_store(&mut self, key: StoreKey);

    fn store_keys(&self) -> Vec<StoreKey>;

    /// Branch over the working state.
    fn cache_multi_store(&self) -> CacheMultiStore;

    /// Read-only branch over a committed version; `0` is the latest.
    fn cache_multi_store_with_version(&self, version: i64) -> Result<CacheMultiStore, StoreError>;

    /// Merges a branch taken from the working state.
    fn write(&mut self, branch: CacheMultiStore) -> Result<(), StoreError>;

    /// Hash the working state would commit to, with `pending` applied on top.
    fn working_hash(&self, pending: Option<&CacheMultiStore>) -> [u8; 32];

    fn commit(&mut self) -> CommitId;

    fn last_commit_id(&self) -> CommitId;

    fn set_initial_version(&mut self, version: i64) -> Result<(), StoreError>;

    /// Makes `version` the working state, dropping anything newer. `0` loads
    /// the latest committed version.
    fn load_version(&mut self, version: i64) -> Result<(), StoreError>;

    /// Drops committed versions older than `below`. The latest version is
    /// always kept. Returns how many versions were dropped.
    fn prune_versions(&mut self, below: i64) -> usize;

    fn set_trace_context(&mut self, context: TraceContext);
}

type Tree = BTreeMap<KeyPath, Vec<u8>>;

struct TreeReader(Arc<Tree>);

impl StoreReader for TreeReader {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.0.get(&(store.clone(), key.to_vec())).cloned())
    }
}

/// In-memory [`CommitMultiStore`] keeping every committed version until it
/// is pruned.
pub struct MemCommitStore {
    stores: Arc<BTreeSet<StoreKey>>,
    working: Arc<Tree>,
    generation: u64,
    versions: BTreeMap<i64, (Arc<Tree>, CommitId)>,
    last: CommitId,
    initial_version: i64,
    trace: Option<TraceContext>,
}

impl Default for MemCommitStore {
    fn default() -> Self {
        Self {
            stores: Arc::new(BTreeSet::new()),
            working: Arc::new(Tree::new()),
            generation: next_generation(),
            versions: BTreeMap::new(),
            last: CommitId::default(),
            initial_version: 0,
            trace: None,
        }
    }
}

impl MemCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stores<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut store = Self::new();
        for name in names {
            store.mount_store(StoreKey::new(name));
        }
        store
    }

    /// Committed versions still held.
    pub fn versions(&self) -> impl Iterator<Item = i64> + '_ {
        self.versions.keys().copied()
    }

    fn branch_over(&self, tree: Arc<Tree>, branched_at: u64) -> CacheMultiStore {
        let mut branch = CacheMultiStore::new(Arc::new(TreeReader(tree)), self.stores.clone(), branched_at);
        if let Some(trace) = &self.trace {
            branch.set_trace_context(trace.clone());
        }
        branch
    }
}

fn hash_tree<'a>(entries: impl Iterator<Item = (&'a KeyPath, &'a Vec<u8>)>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for ((store, key), value) in entries {
        for part in [store.name().as_bytes(), key.as_slice(), value.as_slice()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
    }
    hasher.finalize().into()
}

impl CommitMultiStore for MemCommitStore {
    fn mount_store(&mut self, key: StoreKey) {
        Arc::make_mut(&mut self.stores).insert(key);
    }

    fn store_keys(&self) -> Vec<StoreKey> {
        self.stores.iter().cloned().collect()
    }

    fn cache_multi_store(&self) -> CacheMultiStore {
        self.branch_over(self.working.clone(), self.generation)
    }

    fn cache_multi_store_with_version(&self, version: i64) -> Result<CacheMultiStore, StoreError> {
        let version = if version == 0 { self.last.version } else { version };
        if version == 0 {
            // Nothing committed yet: an empty read-only view.
            return Ok(self.branch_over(Arc::new(Tree::new()), 0));
        }
        let (tree, _) = self
            .versions
            .get(&version)
            .ok_or(StoreError::VersionNotFound(version))?;
        // Never equal to the working generation, so it cannot be written back.
        Ok(self.branch_over(tree.clone(), 0))
    }

    fn write(&mut self, branch: CacheMultiStore) -> Result<(), StoreError> {
        if branch.branched_at() != self.generation {
            return Err(StoreError::StaleBranch {
                expected: self.generation,
                found: branch.branched_at(),
            });
        }
        let writes = branch.into_write_set();
        if writes.is_empty() {
            return Ok(());
        }
        let working = Arc::make_mut(&mut self.working);
        for (path, value) in writes {
            match value {
                Some(value) => working.insert(path, value),
                None => working.remove(&path),
            };
        }
        self.generation = next_generation();
        Ok(())
    }

    fn working_hash(&self, pending: Option<&CacheMultiStore>) -> [u8; 32] {
        match pending.filter(|branch| branch.is_dirty()) {
            None => hash_tree(self.working.iter()),
            Some(branch) => {
                let mut merged = (*self.working).clone();
                for (path, value) in branch.write_set() {
                    match value {
                        Some(value) => merged.insert(path, value),
                        None => merged.remove(&path),
                    };
                }
                hash_tree(merged.iter())
            }
        }
    }

    fn commit(&mut self) -> CommitId {
        let version = if self.last.version == 0 && self.initial_version > 1 {
            self.initial_version
        } else {
            self.last.version + 1
        };
        let id = CommitId {
            version,
            hash: hash_tree(self.working.iter()),
        };
        self.versions.insert(version, (self.working.clone(), id));
        self.last = id;
        tracing::debug!(version, hash = %hex::encode(id.hash), "committed store");
        id
    }

    fn last_commit_id(&self) -> CommitId {
        self.last
    }

    fn set_initial_version(&mut self, version: i64) -> Result<(), StoreError> {
        if self.last.version != 0 {
            return Err(StoreError::InvalidVersion(format!(
                "initial version {version} set after version {} was committed",
                self.last.version
            )));
        }
        self.initial_version = version;
        Ok(())
    }

    fn load_version(&mut self, version: i64) -> Result<(), StoreError> {
        let version = if version == 0 { self.last.version } else { version };
        if version == 0 {
            return Ok(());
        }
        let (tree, id) = self
            .versions
            .get(&version)
            .cloned()
            .ok_or(StoreError::VersionNotFound(version))?;
        self.versions.split_off(&(version + 1));
        self.working = tree;
        self.last = id;
        self.generation = next_generation();
        Ok(())
    }

    fn prune_versions(&mut self, below: i64) -> usize {
        let below = below.min(self.last.version);
        let kept = self.versions.split_off(&below);
        let pruned = std::mem::replace(&mut self.versions, kept).len();
        if pruned > 0 {
            tracing::debug!(below, pruned, "pruned store versions");
        }
        pruned
    }

    fn set_trace_context(&mut self, context: TraceContext) {
        self.trace = Some(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_commit_versions_and_queries() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        let bank = StoreKey::new("bank");

        let mut branch = cms.cache_multi_store();
        branch.set(&bank, b"a", b"1".to_vec()).unwrap();
        cms.write(branch).unwrap();
        let first = cms.commit();
        assert_eq!(first.version, 1);

        let mut branch = cms.cache_multi_store();
        branch.set(&bank, b"a", b"2".to_vec()).unwrap();
        cms.write(branch).unwrap();
        let second = cms.commit();
        assert_eq!(second.version, 2);
        assert_ne!(first.hash, second.hash);

        let old = cms.cache_multi_store_with_version(1).unwrap();
        assert_eq!(old.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));
        let latest = cms.cache_multi_store_with_version(0).unwrap();
        assert_eq!(latest.get(&bank, b"a").unwrap(), Some(b"2".to_vec()));
        assert_matches!(
            cms.cache_multi_store_with_version(9),
            Err(StoreError::VersionNotFound(9))
        );
    }

    #[test]
    fn test_historical_branch_cannot_be_written() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        cms.commit();
        let old = cms.cache_multi_store_with_version(1).unwrap();
        assert_matches!(cms.write(old), Err(StoreError::StaleBranch { .. }));
    }

    #[test]
    fn test_initial_version() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        cms.set_initial_version(10).unwrap();
        assert_eq!(cms.commit().version, 10);
        assert_eq!(cms.commit().version, 11);
        assert!(cms.set_initial_version(3).is_err());
    }

    #[test]
    fn test_working_hash_matches_commit() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        let bank = StoreKey::new("bank");
        let mut branch = cms.cache_multi_store();
        branch.set(&bank, b"k", b"v".to_vec()).unwrap();

        let predicted = cms.working_hash(Some(&branch));
        cms.write(branch).unwrap();
        assert_eq!(cms.commit().hash, predicted);
    }

    #[test]
    fn test_load_version_rolls_back() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        let bank = StoreKey::new("bank");
        cms.commit();
        let mut branch = cms.cache_multi_store();
        branch.set(&bank, b"k", b"v".to_vec()).unwrap();
        cms.write(branch).unwrap();
        cms.commit();

        cms.load_version(1).unwrap();
        assert_eq!(cms.last_commit_id().version, 1);
        assert_eq!(cms.cache_multi_store().get(&bank, b"k").unwrap(), None);
        assert_eq!(cms.versions().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_prune_versions() {
        let mut cms = MemCommitStore::with_stores(["bank"]);
        for _ in 0..5 {
            cms.commit();
        }
        assert_eq!(cms.prune_versions(3), 2);
        assert_eq!(cms.versions().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_matches!(
            cms.cache_multi_store_with_version(2),
            Err(StoreError::VersionNotFound(2))
        );
        assert!(cms.cache_multi_store_with_version(3).is_ok());
        assert_eq!(cms.prune_versions(0), 0);

        // The latest version survives any prune height.
        assert_eq!(cms.prune_versions(100), 2);
        assert_eq!(cms.versions().collect::<Vec<_>>(), vec![5]);
        assert!(cms.cache_multi_store_with_version(0).is_ok());
    }
}
