//! State-sync snapshots.
//!
//! Producing and restoring snapshots is the job of an external
//! [`SnapshotManager`]; the application only decides when to take one and
//! forwards the snapshot RPCs.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub height: u64,
    pub format: u32,
    pub chunks: u32,
    pub hash: Vec<u8>,
    pub metadata: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("unknown snapshot format {0}")]
    UnknownFormat(u32),
    #[error("invalid snapshot metadata: {0}")]
    InvalidMetadata(String),
    #[error("chunk hash mismatch")]
    ChunkHashMismatch,
    #[error("snapshot cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

pub trait SnapshotManager: Send + Sync {
    /// Takes a snapshot of committed `height`. Implementations should poll
    /// `cancel` and give up with [`SnapshotError::Cancelled`] once it is set.
    fn create(&self, height: u64, cancel: &AtomicBool) -> Result<Snapshot, SnapshotError>;

    /// Keeps the `keep_recent` newest snapshots; returns how many were removed.
    fn prune(&self, keep_recent: u32) -> Result<u64, SnapshotError>;

    fn list(&self) -> Result<Vec<Snapshot>, SnapshotError>;

    fn load_chunk(&self, height: u64, format: u32, chunk: u32) -> Result<Vec<u8>, SnapshotError>;

    /// Starts restoring `snapshot`; chunks follow through [`restore_chunk`](Self::restore_chunk).
    fn restore(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    /// Applies the next chunk; returns whether the restore is complete.
    fn restore_chunk(&self, chunk: Vec<u8>) -> Result<bool, SnapshotError>;
}

/// Background snapshot started by Commit.
pub(crate) struct SnapshotTask {
    height: u64,
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

impl SnapshotTask {
    pub(crate) fn spawn(manager: Arc<dyn SnapshotManager>, height: u64, keep_recent: u32) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let handle = thread::spawn(move || snapshot(manager.as_ref(), height, keep_recent, &flag));
        Self {
            height,
            handle,
            cancel,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to end.
    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            error!(height = self.height, "snapshot thread panicked");
        }
    }

    /// Asks the task to stop, then waits for it.
    pub(crate) fn cancel(self) {
        self.cancel.store(true, Ordering::Release);
        self.join();
    }
}

fn snapshot(manager: &dyn SnapshotManager, height: u64, keep_recent: u32, cancel: &AtomicBool) {
    info!(height, "creating state snapshot");
    let snapshot = match manager.create(height, cancel) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(height, %err, "failed to create state snapshot");
            return;
        }
    };
    info!(height, format = snapshot.format, "completed state snapshot");

    if keep_recent > 0 {
        match manager.prune(keep_recent) {
            Ok(pruned) => debug!(pruned, "pruned state snapshots"),
            Err(err) => error!(%err, "failed to prune state snapshots"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        created: Mutex<Vec<u64>>,
        pruned: Mutex<Vec<u32>>,
    }

    impl SnapshotManager for Recorder {
        fn create(&self, height: u64, cancel: &AtomicBool) -> Result<Snapshot, SnapshotError> {
            if cancel.load(Ordering::Acquire) {
                return Err(SnapshotError::Cancelled);
            }
            self.created.lock().push(height);
            Ok(Snapshot {
                height,
                format: 1,
                ..Snapshot::default()
            })
        }

        fn prune(&self, keep_recent: u32) -> Result<u64, SnapshotError> {
            self.pruned.lock().push(keep_recent);
            Ok(0)
        }

        fn list(&self) -> Result<Vec<Snapshot>, SnapshotError> {
            Ok(Vec::new())
        }

        fn load_chunk(&self, _: u64, _: u32, _: u32) -> Result<Vec<u8>, SnapshotError> {
            Ok(Vec::new())
        }

        fn restore(&self, _: Snapshot) -> Result<(), SnapshotError> {
            Ok(())
        }

        fn restore_chunk(&self, _: Vec<u8>) -> Result<bool, SnapshotError> {
            Ok(true)
        }
    }

    #[test]
    fn test_snapshot_then_prune() {
        let recorder = Arc::new(Recorder::default());
        SnapshotTask::spawn(recorder.clone(), 10, 2).join();
        assert_eq!(*recorder.created.lock(), vec![10]);
        assert_eq!(*recorder.pruned.lock(), vec![2]);

        SnapshotTask::spawn(recorder.clone(), 20, 0).join();
        assert_eq!(*recorder.created.lock(), vec![10, 20]);
        assert_eq!(recorder.pruned.lock().len(), 1);
    }
}
