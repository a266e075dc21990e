//! Execution context: a store branch plus everything a handler may look at.

use crate::acl::{MsgIndex, MsgValidator, TxAccessOps};
use crate::app::params::ConsensusParams;
use crate::error::Result;
use crate::events::{Event, EventManager};
use crate::gas::{GasMeter, KvGasConfig};
use crate::store::{CacheMultiStore, StoreKey};
use alloy_primitives::{Address, B256};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Header {
    pub chain_id: String,
    pub height: i64,
    /// Unix seconds.
    pub time: u64,
    pub proposer_address: Vec<u8>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteInfo {
    pub validator_address: Vec<u8>,
    pub power: i64,
    pub signed_last_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    Check,
    ReCheck,
    Simulate,
    Deliver,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Check => "check",
            ExecMode::ReCheck => "recheck",
            ExecMode::Simulate => "simulate",
            ExecMode::Deliver => "deliver",
        }
    }
}

/// Verdict of a pending-transaction re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTxStatus {
    Accepted,
    Pending,
    Rejected,
}

pub type PendingTxChecker = Arc<dyn Fn() -> PendingTxStatus + Send + Sync>;
pub type ExpireTxHandler = Arc<dyn Fn() + Send + Sync>;

/// EVM side-channel metadata a transaction may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvmTxInfo {
    pub sender: Address,
    pub nonce: u64,
    pub tx_hash: B256,
    pub vm_error: String,
}

/// Carrier of a store branch, the block header, gas accounting and events.
///
/// Phase contexts are long-lived; transaction and message contexts are
/// derived from them with [`derive`](Self::derive) and
/// [`branch`](Self::branch) and are merged or dropped when they finish.
pub struct Context {
    ms: CacheMultiStore,
    header: Header,
    header_hash: Vec<u8>,
    mode: ExecMode,
    gas_meter: GasMeter,
    kv_gas: KvGasConfig,
    event_manager: EventManager,
    tx_index: usize,
    tx_checksum: Option<[u8; 32]>,
    msg_index: Option<MsgIndex>,
    vote_infos: Arc<Vec<VoteInfo>>,
    consensus_params: Option<Arc<ConsensusParams>>,
    access_ops: Arc<TxAccessOps>,
    msg_validator: Option<MsgValidator>,
    priority: i64,
    pending_tx_checker: Option<PendingTxChecker>,
    expire_tx_handler: Option<ExpireTxHandler>,
    evm_tx_info: Option<EvmTxInfo>,
}

impl Context {
    pub fn new(ms: CacheMultiStore, header: Header, mode: ExecMode) -> Self {
        Self {
            ms,
            header,
            header_hash: Vec::new(),
            mode,
            gas_meter: GasMeter::infinite(),
            kv_gas: KvGasConfig::default(),
            event_manager: EventManager::new(),
            tx_index: 0,
            tx_checksum: None,
            msg_index: None,
            vote_infos: Arc::new(Vec::new()),
            consensus_params: None,
            access_ops: Arc::new(TxAccessOps::new()),
            msg_validator: None,
            priority: 0,
            pending_tx_checker: None,
            expire_tx_handler: None,
            evm_tx_info: None,
        }
    }

    /// A fresh transaction context over `ms` sharing this context's block data.
    pub fn derive(&self, ms: CacheMultiStore) -> Context {
        let mut ctx = Context::new(ms, self.header.clone(), self.mode);
        ctx.header_hash = self.header_hash.clone();
        ctx.kv_gas = self.kv_gas;
        ctx.vote_infos = self.vote_infos.clone();
        ctx.consensus_params = self.consensus_params.clone();
        ctx.msg_validator = self.msg_validator;
        ctx
    }

    /// A child over a branch of this context's store. Gas, transaction data
    /// and callbacks carry over; events start empty.
    pub fn branch(&self) -> Context {
        Context {
            ms: self.ms.branch(),
            header: self.header.clone(),
            header_hash: self.header_hash.clone(),
            mode: self.mode,
            gas_meter: self.gas_meter.clone(),
            kv_gas: self.kv_gas,
            event_manager: EventManager::new(),
            tx_index: self.tx_index,
            tx_checksum: self.tx_checksum,
            msg_index: self.msg_index,
            vote_infos: self.vote_infos.clone(),
            consensus_params: self.consensus_params.clone(),
            access_ops: self.access_ops.clone(),
            msg_validator: self.msg_validator,
            priority: self.priority,
            pending_tx_checker: self.pending_tx_checker.clone(),
            expire_tx_handler: self.expire_tx_handler.clone(),
            evm_tx_info: self.evm_tx_info.clone(),
        }
    }

    // ============================================================================
    // Store
    // ============================================================================

    pub fn store(&self) -> &CacheMultiStore {
        &self.ms
    }

    pub fn store_mut(&mut self) -> &mut CacheMultiStore {
        &mut self.ms
    }

    pub fn into_store(self) -> CacheMultiStore {
        self.ms
    }

    /// Swaps in another branch, returning the previous one.
    pub fn replace_store(&mut self, ms: CacheMultiStore) -> CacheMultiStore {
        std::mem::replace(&mut self.ms, ms)
    }

    /// Gas-metered read.
    pub fn get(&self, store: &StoreKey, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.gas_meter.consume_gas(self.kv_gas.read_cost_flat, "ReadFlat")?;
        let value = self.ms.get(store, key)?;
        let bytes = key.len() + value.as_ref().map_or(0, Vec::len);
        self.gas_meter
            .consume_gas(self.kv_gas.read_cost_per_byte * bytes as u64, "ReadPerByte")?;
        Ok(value)
    }

    pub fn has(&self, store: &StoreKey, key: &[u8]) -> Result<bool> {
        self.gas_meter.consume_gas(self.kv_gas.has_cost, "Has")?;
        Ok(self.ms.has(store, key)?)
    }

    /// Gas-metered write.
    pub fn set(&mut self, store: &StoreKey, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.gas_meter.consume_gas(self.kv_gas.write_cost_flat, "WriteFlat")?;
        let bytes = (key.len() + value.len()) as u64;
        self.gas_meter
            .consume_gas(self.kv_gas.write_cost_per_byte * bytes, "WritePerByte")?;
        Ok(self.ms.set(store, key, value)?)
    }

    pub fn delete(&mut self, store: &StoreKey, key: &[u8]) -> Result<()> {
        self.gas_meter.consume_gas(self.kv_gas.delete_cost, "Delete")?;
        Ok(self.ms.delete(store, key)?)
    }

    // ============================================================================
    // Block data
    // ============================================================================

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn set_header(&mut self, header: Header) {
        self.header = header;
    }

    pub fn block_height(&self) -> i64 {
        self.header.height
    }

    pub fn chain_id(&self) -> &str {
        &self.header.chain_id
    }

    pub fn header_hash(&self) -> &[u8] {
        &self.header_hash
    }

    pub fn set_header_hash(&mut self, hash: Vec<u8>) {
        self.header_hash = hash;
    }

    pub fn vote_infos(&self) -> &[VoteInfo] {
        &self.vote_infos
    }

    pub fn set_vote_infos(&mut self, votes: Arc<Vec<VoteInfo>>) {
        self.vote_infos = votes;
    }

    pub fn consensus_params(&self) -> Option<&ConsensusParams> {
        self.consensus_params.as_deref()
    }

    pub fn set_consensus_params(&mut self, params: Option<Arc<ConsensusParams>>) {
        self.consensus_params = params;
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecMode) {
        self.mode = mode;
    }

    pub fn is_check_tx(&self) -> bool {
        matches!(self.mode, ExecMode::Check | ExecMode::ReCheck)
    }

    pub fn is_recheck_tx(&self) -> bool {
        self.mode == ExecMode::ReCheck
    }

    pub fn is_simulate(&self) -> bool {
        self.mode == ExecMode::Simulate
    }

    pub fn is_deliver(&self) -> bool {
        self.mode == ExecMode::Deliver
    }

    // ============================================================================
    // Gas and events
    // ============================================================================

    pub fn gas_meter(&self) -> &GasMeter {
        &self.gas_meter
    }

    pub fn set_gas_meter(&mut self, meter: GasMeter) {
        self.gas_meter = meter;
    }

    pub fn kv_gas_config(&self) -> KvGasConfig {
        self.kv_gas
    }

    pub fn set_kv_gas_config(&mut self, config: KvGasConfig) {
        self.kv_gas = config;
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }

    pub fn event_manager_mut(&mut self) -> &mut EventManager {
        &mut self.event_manager
    }

    pub fn emit_event(&mut self, event: Event) {
        self.event_manager.emit(event);
    }

    // ============================================================================
    // Transaction data
    // ============================================================================

    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    pub fn set_tx_index(&mut self, index: usize) {
        self.tx_index = index;
    }

    pub fn tx_checksum(&self) -> Option<[u8; 32]> {
        self.tx_checksum
    }

    pub fn set_tx_checksum(&mut self, checksum: [u8; 32]) {
        self.tx_checksum = Some(checksum);
    }

    pub fn msg_index(&self) -> Option<MsgIndex> {
        self.msg_index
    }

    pub fn set_msg_index(&mut self, index: MsgIndex) {
        self.msg_index = Some(index);
    }

    pub fn access_ops(&self) -> &TxAccessOps {
        &self.access_ops
    }

    pub fn set_access_ops(&mut self, ops: TxAccessOps) {
        self.access_ops = Arc::new(ops);
    }

    pub fn msg_validator(&self) -> Option<&MsgValidator> {
        self.msg_validator.as_ref()
    }

    pub fn set_msg_validator(&mut self, validator: Option<MsgValidator>) {
        self.msg_validator = validator;
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i64) {
        self.priority = priority;
    }

    pub fn pending_tx_checker(&self) -> Option<&PendingTxChecker> {
        self.pending_tx_checker.as_ref()
    }

    pub fn set_pending_tx_checker(&mut self, checker: PendingTxChecker) {
        self.pending_tx_checker = Some(checker);
    }

    pub fn expire_tx_handler(&self) -> Option<&ExpireTxHandler> {
        self.expire_tx_handler.as_ref()
    }

    pub fn set_expire_tx_handler(&mut self, handler: ExpireTxHandler) {
        self.expire_tx_handler = Some(handler);
    }

    pub fn evm_tx_info(&self) -> Option<&EvmTxInfo> {
        self.evm_tx_info.as_ref()
    }

    pub fn set_evm_tx_info(&mut self, info: EvmTxInfo) {
        self.evm_tx_info = Some(info);
    }

    /// Takes over what the ante phase left on `ante`: gas meter, priority,
    /// callbacks and EVM metadata.
    pub(crate) fn adopt_ante_outputs(&mut self, ante: &Context) {
        self.gas_meter = ante.gas_meter.clone();
        self.priority = ante.priority;
        self.pending_tx_checker = ante.pending_tx_checker.clone();
        self.expire_tx_handler = ante.expire_tx_handler.clone();
        self.evm_tx_info = ante.evm_tx_info.clone();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("height", &self.header.height)
            .field("mode", &self.mode)
            .field("tx_index", &self.tx_index)
            .field("msg_index", &self.msg_index)
            .field("gas_used", &self.gas_meter.consumed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{CommitMultiStore, MemCommitStore};
    use assert_matches::assert_matches;

    fn ctx() -> (Context, StoreKey) {
        let cms = MemCommitStore::with_stores(["bank"]);
        let ctx = Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Deliver);
        (ctx, StoreKey::new("bank"))
    }

    #[test]
    fn test_store_access_charges_gas() {
        let (mut ctx, bank) = ctx();
        ctx.set_gas_meter(GasMeter::new(1_000_000));

        ctx.set(&bank, b"k", b"vv".to_vec()).unwrap();
        assert_eq!(ctx.gas_meter().consumed(), 2000 + 30 * 3);

        ctx.get(&bank, b"k").unwrap();
        assert_eq!(ctx.gas_meter().consumed(), 2090 + 1000 + 3 * 3);
    }

    #[test]
    fn test_out_of_gas_surfaces_as_error() {
        let (mut ctx, bank) = ctx();
        ctx.set_gas_meter(GasMeter::new(100));
        assert_matches!(
            ctx.set(&bank, b"k", vec![]),
            Err(Error::GasExhausted { descriptor }) if descriptor == "WriteFlat"
        );
    }

    #[test]
    fn test_branch_shares_gas_but_not_events() {
        let (mut ctx, bank) = ctx();
        ctx.set_gas_meter(GasMeter::new(1_000_000));
        ctx.emit_event(Event::new("parent"));

        let mut child = ctx.branch();
        child.set(&bank, b"k", vec![1]).unwrap();
        assert!(child.event_manager().events().is_empty());
        assert_eq!(ctx.gas_meter().consumed(), child.gas_meter().consumed());
        assert_eq!(ctx.get(&bank, b"k").unwrap(), None);

        ctx.store_mut().write(child.into_store()).unwrap();
        assert_eq!(ctx.get(&bank, b"k").unwrap(), Some(vec![1]));
    }
}
