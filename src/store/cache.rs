//! Copy-on-write branch of the multi-store.

use super::{AccessEvent, AccessMode, StoreError, StoreKey, StoreReader, TraceContext};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fully qualified key: substore plus raw key.
pub type KeyPath = (StoreKey, Vec<u8>);

/// Buffered writes of a branch in key order. `None` deletes.
pub type WriteSet = Vec<(KeyPath, Option<Vec<u8>>)>;

type Dirty = BTreeMap<KeyPath, Option<Vec<u8>>>;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Generations are unique across all stores, so a branch can only be merged
/// into the exact state it was taken from.
pub(crate) fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Frozen view of a branch at the moment a child was taken.
struct Layer {
    parent: Arc<dyn StoreReader>,
    dirty: Arc<Dirty>,
}

impl StoreReader for Layer {
    fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.dirty.get(&(store.clone(), key.to_vec())) {
            Some(value) => Ok(value.clone()),
            None => self.parent.get(store, key),
        }
    }
}

/// A branch of state that buffers writes until merged into its parent.
///
/// Taking a child with [`branch`](Self::branch) is O(1): the child shares this
/// branch's buffer and the buffer is copied lazily on the next write here.
/// Every read and write is appended to an access log used to validate declared
/// access operations.
pub struct CacheMultiStore {
    parent: Arc<dyn StoreReader>,
    dirty: Arc<Dirty>,
    stores: Arc<BTreeSet<StoreKey>>,
    branched_at: u64,
    generation: u64,
    events: Mutex<Vec<AccessEvent>>,
    trace: Option<Arc<TraceContext>>,
}

impl fmt::Debug for CacheMultiStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMultiStore")
            .field("writes", &self.dirty.len())
            .field("branched_at", &self.branched_at)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl CacheMultiStore {
    /// Creates a branch over `parent` whose state had generation `branched_at`.
    pub fn new(
        parent: Arc<dyn StoreReader>,
        stores: Arc<BTreeSet<StoreKey>>,
        branched_at: u64,
    ) -> Self {
        Self {
            parent,
            dirty: Arc::new(Dirty::new()),
            stores,
            branched_at,
            generation: next_generation(),
            events: Mutex::new(Vec::new()),
            trace: None,
        }
    }

    fn ensure_mounted(&self, store: &StoreKey) -> Result<(), StoreError> {
        if self.stores.contains(store) {
            Ok(())
        } else {
            Err(StoreError::UnknownStore(store.to_string()))
        }
    }

    fn record(&self, mode: AccessMode, store: &StoreKey, key: &[u8]) {
        self.events.lock().push(AccessEvent {
            mode,
            store: store.clone(),
            key: key.to_vec(),
        });
    }

    pub fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_mounted(store)?;
        self.record(AccessMode::Read, store, key);
        match self.dirty.get(&(store.clone(), key.to_vec())) {
            Some(value) => Ok(value.clone()),
            None => self.parent.get(store, key),
        }
    }

    pub fn has(&self, store: &StoreKey, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(store, key)?.is_some())
    }

    pub fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.put(store, key, Some(value))
    }

    pub fn delete(&mut self, store: &StoreKey, key: &[u8]) -> Result<(), StoreError> {
        self.put(store, key, None)
    }

    fn put(&mut self, store: &StoreKey, key: &[u8], value: Option<Vec<u8>>) -> Result<(), StoreError> {
        self.ensure_mounted(store)?;
        self.record(AccessMode::Write, store, key);
        if let Some(trace) = &self.trace {
            tracing::trace!(
                store = %store,
                key = %hex::encode(key),
                delete = value.is_none(),
                context = ?trace,
                "store write"
            );
        }
        Arc::make_mut(&mut self.dirty).insert((store.clone(), key.to_vec()), value);
        self.generation = next_generation();
        Ok(())
    }

    /// Takes a child branch over the current state.
    pub fn branch(&self) -> CacheMultiStore {
        let layer = Layer {
            parent: self.parent.clone(),
            dirty: self.dirty.clone(),
        };
        let mut child = CacheMultiStore::new(Arc::new(layer), self.stores.clone(), self.generation);
        child.trace = self.trace.clone();
        child
    }

    /// Read-only snapshot of the current state.
    pub fn freeze(&self) -> Arc<dyn StoreReader> {
        Arc::new(Layer {
            parent: self.parent.clone(),
            dirty: self.dirty.clone(),
        })
    }

    /// A sibling with identical contents and the same parent, so it can stand
    /// in for this branch later. The access log is not copied.
    pub fn fork(&self) -> CacheMultiStore {
        Self {
            parent: self.parent.clone(),
            dirty: self.dirty.clone(),
            stores: self.stores.clone(),
            branched_at: self.branched_at,
            generation: next_generation(),
            events: Mutex::new(Vec::new()),
            trace: self.trace.clone(),
        }
    }

    /// Merges a child branch into this one, appending the child's access log
    /// to this branch's log.
    ///
    /// Fails if this branch was modified after the child was taken.
    pub fn write(&mut self, child: CacheMultiStore) -> Result<(), StoreError> {
        if child.branched_at != self.generation {
            return Err(StoreError::StaleBranch {
                expected: self.generation,
                found: child.branched_at,
            });
        }
        self.events.get_mut().extend(child.events.into_inner());
        if child.dirty.is_empty() {
            return Ok(());
        }
        let writes = Arc::try_unwrap(child.dirty).unwrap_or_else(|shared| (*shared).clone());
        Arc::make_mut(&mut self.dirty).extend(writes);
        self.generation = next_generation();
        Ok(())
    }

    /// Applies writes produced against an equivalent view of this branch.
    pub fn apply_write_set(&mut self, writes: WriteSet) {
        if writes.is_empty() {
            return;
        }
        Arc::make_mut(&mut self.dirty).extend(writes);
        self.generation = next_generation();
    }

    /// Buffered writes, in key order.
    pub fn write_set(&self) -> WriteSet {
        self.dirty
            .iter()
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    pub fn into_write_set(self) -> WriteSet {
        Arc::try_unwrap(self.dirty)
            .unwrap_or_else(|shared| (*shared).clone())
            .into_iter()
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Accesses observed through this branch since the last reset.
    pub fn get_events(&self) -> Vec<AccessEvent> {
        self.events.lock().clone()
    }

    pub fn reset_events(&self) {
        self.events.lock().clear();
    }

    pub fn set_trace_context(&mut self, context: TraceContext) {
        self.trace = Some(Arc::new(context));
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.trace.as_deref()
    }

    pub fn store_keys(&self) -> impl Iterator<Item = &StoreKey> {
        self.stores.iter()
    }

    pub(crate) fn mounted(&self) -> Arc<BTreeSet<StoreKey>> {
        self.stores.clone()
    }

    pub(crate) fn branched_at(&self) -> u64 {
        self.branched_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Empty;

    impl StoreReader for Empty {
        fn get(&self, _: &StoreKey, _: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
    }

    fn root() -> (CacheMultiStore, StoreKey) {
        let key = StoreKey::new("bank");
        let stores = Arc::new(BTreeSet::from([key.clone()]));
        (CacheMultiStore::new(Arc::new(Empty), stores, 0), key)
    }

    #[test]
    fn test_child_is_isolated_until_written() {
        let (mut parent, bank) = root();
        parent.set(&bank, b"a", b"1".to_vec()).unwrap();

        let mut child = parent.branch();
        assert_eq!(child.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));
        child.set(&bank, b"a", b"2".to_vec()).unwrap();
        child.delete(&bank, b"b").unwrap();
        assert_eq!(parent.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));

        parent.write(child).unwrap();
        assert_eq!(parent.get(&bank, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(parent.get(&bank, b"b").unwrap(), None);
    }

    #[test]
    fn test_dropped_child_discards_writes() {
        let (parent, bank) = root();
        {
            let mut child = parent.branch();
            child.set(&bank, b"a", b"1".to_vec()).unwrap();
        }
        assert_eq!(parent.get(&bank, b"a").unwrap(), None);
    }

    #[test]
    fn test_child_snapshot_ignores_later_parent_writes() {
        let (mut parent, bank) = root();
        let child = parent.branch();
        parent.set(&bank, b"a", b"1".to_vec()).unwrap();
        assert_eq!(child.get(&bank, b"a").unwrap(), None);
    }

    #[test]
    fn test_stale_child_is_rejected() {
        let (mut parent, bank) = root();
        let mut first = parent.branch();
        let mut second = parent.branch();
        first.set(&bank, b"a", b"1".to_vec()).unwrap();
        second.set(&bank, b"a", b"2".to_vec()).unwrap();

        parent.write(first).unwrap();
        assert_matches!(parent.write(second), Err(StoreError::StaleBranch { .. }));
        assert_eq!(parent.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_fork_can_replace_original() {
        let (mut parent, bank) = root();
        let mut branch = parent.branch();
        branch.set(&bank, b"a", b"1".to_vec()).unwrap();
        let checkpoint = branch.fork();

        branch.set(&bank, b"a", b"dirty".to_vec()).unwrap();
        let restored = checkpoint.fork();
        assert_eq!(restored.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));

        parent.write(restored).unwrap();
        assert_eq!(parent.get(&bank, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_access_log() {
        let (mut store, bank) = root();
        store.get(&bank, b"r").unwrap();
        store.set(&bank, b"w", vec![1]).unwrap();

        let events = store.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].mode, AccessMode::Read);
        assert_eq!(events[1].mode, AccessMode::Write);
        assert_eq!(events[1].key, b"w".to_vec());

        store.reset_events();
        assert!(store.get_events().is_empty());
    }

    #[test]
    fn test_nested_branch_accesses_reach_parent_log() {
        let (mut parent, bank) = root();
        let mut child = parent.branch();
        let mut grandchild = child.branch();
        grandchild.get(&bank, b"r").unwrap();
        grandchild.set(&bank, b"w", vec![1]).unwrap();
        child.write(grandchild).unwrap();
        assert_eq!(child.get_events().len(), 2);
        parent.write(child).unwrap();

        let events = parent.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].mode, events[0].key.as_slice()), (AccessMode::Read, &b"r"[..]));
        assert_eq!((events[1].mode, events[1].key.as_slice()), (AccessMode::Write, &b"w"[..]));
    }

    #[test]
    fn test_debug_output() {
        let (mut store, bank) = root();
        store.set(&bank, b"a", vec![1]).unwrap();
        let out = format!("{store:?}");
        assert!(out.starts_with("CacheMultiStore { writes: 1, branched_at: 0"), "{out}");
    }

    #[test]
    fn test_read_only_child_still_reports_reads() {
        let (mut parent, bank) = root();
        let child = parent.branch();
        child.get(&bank, b"r").unwrap();
        parent.write(child).unwrap();

        assert!(!parent.is_dirty());
        assert_eq!(parent.get_events().len(), 1);
    }

    #[test]
    fn test_unknown_store() {
        let (store, _) = root();
        assert_matches!(
            store.get(&StoreKey::new("evm"), b"a"),
            Err(StoreError::UnknownStore(name)) if name == "evm"
        );
    }
}
