//! Resolved application configuration.

use crate::acl::ValidationMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default number of scheduler workers for a batch.
pub const DEFAULT_CONCURRENCY_WORKERS: usize = 20;

/// Default incarnation from which a transaction only re-runs at the frontier.
pub const DEFAULT_MAX_INCARNATIONS: usize = 10;

/// Values the application consumes; loading them is up to the embedding process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub chain_id: String,
    pub concurrency_workers: usize,
    pub occ_enabled: bool,
    pub max_incarnations: usize,
    /// Halt after committing this height; 0 disables.
    pub halt_height: u64,
    /// Halt after committing a block at or past this unix time; 0 disables.
    pub halt_time: u64,
    pub min_retain_blocks: u64,
    pub snapshot_interval: u64,
    pub snapshot_keep_recent: u32,
    /// `type.key` attributes to index; empty indexes everything.
    pub index_events: BTreeSet<String>,
    /// Access-operation validation in Deliver mode; `None` disables it.
    pub access_validation: Option<ValidationMode>,
    /// Log every store write with the transaction's trace context.
    pub trace: bool,
    pub app_version: u64,
    pub version: String,
    pub initial_height: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            concurrency_workers: DEFAULT_CONCURRENCY_WORKERS,
            occ_enabled: true,
            max_incarnations: DEFAULT_MAX_INCARNATIONS,
            halt_height: 0,
            halt_time: 0,
            min_retain_blocks: 0,
            snapshot_interval: 0,
            snapshot_keep_recent: 0,
            index_events: BTreeSet::new(),
            access_validation: Some(ValidationMode::Permissive),
            trace: false,
            app_version: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
            initial_height: 0,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_incarnations == 0 {
            return Err(Error::InvalidRequest(
                "max_incarnations must be at least 1".into(),
            ));
        }
        if self.initial_height < 0 {
            return Err(Error::InvalidRequest(format!(
                "initial height must not be negative, got {}",
                self.initial_height
            )));
        }
        if self.snapshot_interval > 0 && self.snapshot_keep_recent == 0 {
            tracing::warn!(
                interval = self.snapshot_interval,
                "snapshots enabled without keep-recent; every snapshot is retained"
            );
        }
        Ok(())
    }

    /// Whether batches go through the parallel scheduler.
    pub fn runs_parallel(&self) -> bool {
        self.occ_enabled && self.concurrency_workers > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.concurrency_workers, 20);
        assert!(config.occ_enabled);
        assert!(config.runs_parallel());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"chain_id":"sei-test","concurrency_workers":1}"#).unwrap();
        assert_eq!(config.chain_id, "sei-test");
        assert!(!config.runs_parallel());
        assert_eq!(config.max_incarnations, DEFAULT_MAX_INCARNATIONS);
    }

    #[test]
    fn test_rejects_zero_incarnations() {
        let config = AppConfig {
            max_incarnations: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
