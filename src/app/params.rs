//! Consensus parameters and their persistence.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::StoreKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const PARAM_STORE_KEY_BLOCK_PARAMS: &str = "BlockParams";
pub const PARAM_STORE_KEY_EVIDENCE_PARAMS: &str = "EvidenceParams";
pub const PARAM_STORE_KEY_VALIDATOR_PARAMS: &str = "ValidatorParams";
pub const PARAM_STORE_KEY_VERSION_PARAMS: &str = "VersionParams";
pub const PARAM_STORE_KEY_SYNCHRONY_PARAMS: &str = "SynchronyParams";
pub const PARAM_STORE_KEY_TIMEOUT_PARAMS: &str = "TimeoutParams";
pub const PARAM_STORE_KEY_ABCI_PARAMS: &str = "ABCIParams";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    pub max_bytes: i64,
    pub max_gas: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    pub max_age_num_blocks: i64,
    /// Seconds.
    pub max_age_duration: u64,
    pub max_bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    pub pub_key_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionParams {
    pub app_version: u64,
}

/// Durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronyParams {
    pub precision: u64,
    pub message_delay: u64,
}

/// Durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutParams {
    pub propose: u64,
    pub propose_delta: u64,
    pub vote: u64,
    pub vote_delta: u64,
    pub commit: u64,
    pub bypass_commit_timeout: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbciParams {
    pub vote_extensions_enable_height: i64,
    pub recheck_tx: bool,
}

/// Consensus parameters; each group is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub block: Option<BlockParams>,
    pub evidence: Option<EvidenceParams>,
    pub validator: Option<ValidatorParams>,
    pub version: Option<VersionParams>,
    pub synchrony: Option<SynchronyParams>,
    pub timeout: Option<TimeoutParams>,
    pub abci: Option<AbciParams>,
}

/// Raw parameter storage addressed by fixed keys.
pub trait ParamStore: Send + Sync {
    fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, ctx: &mut Context, key: &str, value: Vec<u8>) -> Result<()>;
}

fn load<T: DeserializeOwned>(store: &dyn ParamStore, ctx: &Context, key: &str) -> Result<Option<T>> {
    store
        .get(ctx, key)?
        .map(|raw| {
            serde_json::from_slice(&raw)
                .map_err(|err| Error::Store(format!("malformed consensus param {key}: {err}")))
        })
        .transpose()
}

fn save<T: Serialize>(store: &dyn ParamStore, ctx: &mut Context, key: &str, value: &Option<T>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let raw = serde_json::to_vec(value)
        .map_err(|err| Error::Store(format!("encode consensus param {key}: {err}")))?;
    store.set(ctx, key, raw)
}

impl ConsensusParams {
    /// Reads every group present under its key.
    pub fn load(store: &dyn ParamStore, ctx: &Context) -> Result<Self> {
        Ok(Self {
            block: load(store, ctx, PARAM_STORE_KEY_BLOCK_PARAMS)?,
            evidence: load(store, ctx, PARAM_STORE_KEY_EVIDENCE_PARAMS)?,
            validator: load(store, ctx, PARAM_STORE_KEY_VALIDATOR_PARAMS)?,
            version: load(store, ctx, PARAM_STORE_KEY_VERSION_PARAMS)?,
            synchrony: load(store, ctx, PARAM_STORE_KEY_SYNCHRONY_PARAMS)?,
            timeout: load(store, ctx, PARAM_STORE_KEY_TIMEOUT_PARAMS)?,
            abci: load(store, ctx, PARAM_STORE_KEY_ABCI_PARAMS)?,
        })
    }

    /// Writes every group that is set; absent groups keep their stored value.
    pub fn store(&self, store: &dyn ParamStore, ctx: &mut Context) -> Result<()> {
        save(store, ctx, PARAM_STORE_KEY_BLOCK_PARAMS, &self.block)?;
        save(store, ctx, PARAM_STORE_KEY_EVIDENCE_PARAMS, &self.evidence)?;
        save(store, ctx, PARAM_STORE_KEY_VALIDATOR_PARAMS, &self.validator)?;
        save(store, ctx, PARAM_STORE_KEY_VERSION_PARAMS, &self.version)?;
        save(store, ctx, PARAM_STORE_KEY_SYNCHRONY_PARAMS, &self.synchrony)?;
        save(store, ctx, PARAM_STORE_KEY_TIMEOUT_PARAMS, &self.timeout)?;
        save(store, ctx, PARAM_STORE_KEY_ABCI_PARAMS, &self.abci)
    }
}

/// [`ParamStore`] over a mounted substore, bypassing gas.
#[derive(Debug, Clone)]
pub struct KvParamStore {
    store: StoreKey,
}

impl KvParamStore {
    pub fn new(store: StoreKey) -> Self {
        Self { store }
    }
}

impl ParamStore for KvParamStore {
    fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(ctx.store().get(&self.store, key.as_bytes())?)
    }

    fn set(&self, ctx: &mut Context, key: &str, value: Vec<u8>) -> Result<()> {
        Ok(ctx.store_mut().set(&self.store, key.as_bytes(), value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecMode, Header};
    use crate::store::{CommitMultiStore, MemCommitStore};

    #[test]
    fn test_store_and_load() {
        let cms = MemCommitStore::with_stores(["params"]);
        let mut ctx = Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Deliver);
        let store = KvParamStore::new(StoreKey::new("params"));

        assert_eq!(ConsensusParams::load(&store, &ctx).unwrap(), ConsensusParams::default());

        let params = ConsensusParams {
            block: Some(BlockParams {
                max_bytes: 1 << 20,
                max_gas: 10_000_000,
            }),
            evidence: Some(EvidenceParams {
                max_age_num_blocks: 100,
                max_age_duration: 3600,
                max_bytes: 1024,
            }),
            ..ConsensusParams::default()
        };
        params.store(&store, &mut ctx).unwrap();
        assert_eq!(ConsensusParams::load(&store, &ctx).unwrap(), params);

        // Groups left out keep what was stored.
        let update = ConsensusParams {
            abci: Some(AbciParams {
                vote_extensions_enable_height: 0,
                recheck_tx: true,
            }),
            ..ConsensusParams::default()
        };
        update.store(&store, &mut ctx).unwrap();
        let loaded = ConsensusParams::load(&store, &ctx).unwrap();
        assert_eq!(loaded.block, params.block);
        assert_eq!(loaded.abci, update.abci);
    }

    #[test]
    fn test_malformed_value() {
        let cms = MemCommitStore::with_stores(["params"]);
        let mut ctx = Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Deliver);
        let store = KvParamStore::new(StoreKey::new("params"));
        store.set(&mut ctx, PARAM_STORE_KEY_BLOCK_PARAMS, b"not json".to_vec()).unwrap();
        assert!(matches!(ConsensusParams::load(&store, &ctx), Err(Error::Store(_))));
    }
}
