//! Request and response types of the ABCI surface.

use super::params::ConsensusParams;
use super::snapshot::Snapshot;
use crate::context::{EvmTxInfo, ExpireTxHandler, Header, PendingTxChecker, VoteInfo};
use crate::error::{Error, CODE_OK};
use crate::events::Event;
use crate::tx::GasInfo;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct RequestInitChain {
    /// Genesis time, unix seconds.
    pub time: u64,
    pub chain_id: String,
    pub consensus_params: Option<ConsensusParams>,
    pub app_state_bytes: Vec<u8>,
    pub initial_height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInitChain {
    pub consensus_params: Option<ConsensusParams>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub data: String,
    pub version: String,
    pub app_version: u64,
    pub last_block_height: i64,
    pub last_block_app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestBeginBlock {
    pub hash: Vec<u8>,
    pub header: Header,
    pub votes: Vec<VoteInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBeginBlock {
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEndBlock {
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEndBlock {
    pub events: Vec<Event>,
    pub consensus_param_updates: Option<ConsensusParams>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckTxType {
    #[default]
    New,
    Recheck,
}

#[derive(Debug, Clone, Default)]
pub struct RequestCheckTx {
    pub tx: Vec<u8>,
    pub kind: CheckTxType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCheckTx {
    pub code: u32,
    pub codespace: String,
    pub log: String,
    pub data: Vec<u8>,
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub events: Vec<Event>,
    pub priority: i64,
}

impl ResponseCheckTx {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Check response plus the mempool callbacks the ante phase produced.
#[derive(Clone, Default)]
pub struct ResponseCheckTxV2 {
    pub response: ResponseCheckTx,
    pub is_pending: bool,
    pub checker: Option<PendingTxChecker>,
    pub expire_handler: Option<ExpireTxHandler>,
    pub evm_tx_info: Option<EvmTxInfo>,
}

impl fmt::Debug for ResponseCheckTxV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCheckTxV2")
            .field("response", &self.response)
            .field("is_pending", &self.is_pending)
            .field("checker", &self.checker.is_some())
            .field("expire_handler", &self.expire_handler.is_some())
            .field("evm_tx_info", &self.evm_tx_info)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDeliverTx {
    pub code: u32,
    pub codespace: String,
    pub log: String,
    pub data: Vec<u8>,
    pub gas_wanted: u64,
    pub gas_used: u64,
    pub events: Vec<Event>,
    pub evm_tx_info: Option<EvmTxInfo>,
}

impl ResponseDeliverTx {
    pub fn from_error(err: &Error, gas: GasInfo, events: Vec<Event>) -> Self {
        let (codespace, code) = err.abci_info();
        Self {
            code,
            codespace: codespace.to_string(),
            log: err.to_string(),
            gas_wanted: gas.gas_wanted,
            gas_used: gas.gas_used,
            events,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestDeliverTxBatch {
    pub txs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseDeliverTxBatch {
    pub results: Vec<ResponseDeliverTx>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFinalizeBlock {
    pub txs: Vec<Vec<u8>>,
    pub decided_last_commit: Vec<VoteInfo>,
    pub hash: Vec<u8>,
    pub height: i64,
    /// Block time, unix seconds.
    pub time: u64,
    pub proposer_address: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFinalizeBlock {
    pub events: Vec<Event>,
    pub tx_results: Vec<ResponseDeliverTx>,
    pub consensus_param_updates: Option<ConsensusParams>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRecordAction {
    Unmodified,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub action: TxRecordAction,
    pub tx: Vec<u8>,
}

impl TxRecord {
    pub fn unmodified(tx: Vec<u8>) -> Self {
        Self {
            action: TxRecordAction::Unmodified,
            tx,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestPrepareProposal {
    pub max_tx_bytes: i64,
    pub txs: Vec<Vec<u8>>,
    pub local_last_commit: Vec<VoteInfo>,
    pub height: i64,
    pub time: u64,
    pub proposer_address: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponsePrepareProposal {
    pub tx_records: Vec<TxRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestProcessProposal {
    pub txs: Vec<Vec<u8>>,
    pub proposed_last_commit: Vec<VoteInfo>,
    pub hash: Vec<u8>,
    pub height: i64,
    pub time: u64,
    pub proposer_address: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProposalStatus {
    #[default]
    Unknown,
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseProcessProposal {
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseCommit {
    pub retain_height: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestQuery {
    pub data: Vec<u8>,
    pub path: String,
    pub height: i64,
    pub prove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseQuery {
    pub code: u32,
    pub codespace: String,
    pub log: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub height: i64,
}

impl ResponseQuery {
    pub fn from_error(err: &Error) -> Self {
        let (codespace, code) = err.abci_info();
        Self {
            code,
            codespace: codespace.to_string(),
            log: err.to_string(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseListSnapshots {
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOfferSnapshot {
    pub snapshot: Option<Snapshot>,
    pub app_hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfferSnapshotResult {
    #[default]
    Unknown,
    Accept,
    Abort,
    Reject,
    RejectFormat,
    RejectSender,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLoadSnapshotChunk {
    pub height: u64,
    pub format: u32,
    pub chunk: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseLoadSnapshotChunk {
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestApplySnapshotChunk {
    pub index: u32,
    pub chunk: Vec<u8>,
    pub sender: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplySnapshotChunkResult {
    #[default]
    Unknown,
    Accept,
    Abort,
    Retry,
    RetrySnapshot,
    RejectSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseApplySnapshotChunk {
    pub result: ApplySnapshotChunkResult,
    pub refetch_chunks: Vec<u32>,
    pub reject_senders: Vec<String>,
}
