//! Transaction bundles queued for future heights.

use std::collections::BTreeMap;

/// Ordered bundles of raw transactions keyed by target height.
#[derive(Debug, Clone, Default)]
pub struct BundleStore {
    bundles: BTreeMap<i64, Vec<Vec<u8>>>,
}

impl BundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `txs` for `height`, after anything already queued there.
    pub fn submit_bundle(&mut self, height: i64, txs: impl IntoIterator<Item = Vec<u8>>) {
        self.bundles.entry(height).or_default().extend(txs);
    }

    /// Transactions queued for exactly `height`; empty when none are.
    pub fn bundle_at(&self, height: i64) -> &[Vec<u8>] {
        self.bundles.get(&height).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drops every bundle at or below `height` and returns how many were dropped.
    pub fn drop_bundles_at_and_below(&mut self, height: i64) -> usize {
        let kept = match height.checked_add(1) {
            Some(above) => self.bundles.split_off(&above),
            None => BTreeMap::new(),
        };
        let dropped = std::mem::replace(&mut self.bundles, kept);
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Heights with a queued bundle, ascending.
    pub fn heights(&self) -> impl Iterator<Item = i64> + '_ {
        self.bundles.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> BundleStore {
        let mut store = BundleStore::new();
        for height in (100..1000).step_by(23) {
            store.submit_bundle(height, [height.to_be_bytes().to_vec()]);
        }
        store
    }

    #[test]
    fn test_drop_at_and_below() {
        let mut store = filled();
        store.drop_bundles_at_and_below(500);

        for height in 0..500 {
            assert!(store.bundle_at(height).is_empty(), "height {height}");
        }
        for height in (514..1000).step_by(23) {
            assert_eq!(store.bundle_at(height), &[height.to_be_bytes().to_vec()]);
        }
        assert_eq!(store.heights().next(), Some(514));
    }

    #[test]
    fn test_drop_is_idempotent() {
        let mut once = filled();
        once.drop_bundles_at_and_below(500);
        let mut twice = filled();
        twice.drop_bundles_at_and_below(500);
        assert_eq!(twice.drop_bundles_at_and_below(500), 0);
        assert_eq!(once.heights().collect::<Vec<_>>(), twice.heights().collect::<Vec<_>>());

        let mut empty = BundleStore::new();
        assert_eq!(empty.drop_bundles_at_and_below(500), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_submit_appends() {
        let mut store = BundleStore::new();
        store.submit_bundle(7, [vec![1]]);
        store.submit_bundle(7, [vec![2], vec![3]]);
        assert_eq!(store.bundle_at(7), &[vec![1], vec![2], vec![3]]);
        assert_eq!(store.drop_bundles_at_and_below(i64::MAX), 1);
        assert!(store.is_empty());
    }
}
