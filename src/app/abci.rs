//! ABCI methods.

use super::params::ConsensusParams;
use super::snapshot::{SnapshotError, SnapshotTask};
use super::state::StateKind;
use super::types::*;
use super::{AppPhase, BaseApp};
use crate::context::{ExecMode, Header};
use crate::error::{Error, Result};
use crate::events::{mark_events_to_index, Event};
use crate::tx::{tx_checksum, GasInfo, TxEntry, TxResult};
use sha2::{Digest, Sha256};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl BaseApp {
    pub fn info(&self) -> ResponseInfo {
        let last = self.last_commit_id();
        ResponseInfo {
            data: self.name.clone(),
            version: self.config.version.clone(),
            app_version: self.config.app_version,
            last_block_height: last.version,
            last_block_app_hash: if last.is_zero() {
                Vec::new()
            } else {
                last.hash.to_vec()
            },
        }
    }

    pub fn init_chain(&mut self, req: &RequestInitChain) -> Result<ResponseInitChain> {
        self.chain_id = req.chain_id.clone();
        self.initial_height = req.initial_height;
        if req.initial_height > 1 {
            self.cms.set_initial_version(req.initial_height)?;
        }

        let header = Header {
            chain_id: req.chain_id.clone(),
            height: req.initial_height,
            time: req.time,
            ..Header::default()
        };
        for kind in [
            StateKind::Deliver,
            StateKind::Check,
            StateKind::PrepareProposal,
            StateKind::ProcessProposal,
        ] {
            self.set_state(kind, header.clone());
        }

        if let Some(params) = &req.consensus_params {
            let Some(store) = self.param_store.clone() else {
                panic!("cannot store consensus params with no params store set");
            };
            let shared = Arc::new(params.clone());
            for kind in [
                StateKind::Deliver,
                StateKind::Check,
                StateKind::PrepareProposal,
                StateKind::ProcessProposal,
            ] {
                if let Some(state) = self.state_mut(kind) {
                    params.store(store.as_ref(), state.ctx_mut())?;
                    state.ctx_mut().set_consensus_params(Some(shared.clone()));
                    state.checkpoint();
                }
            }
        }
        self.state_to_commit = Some(StateKind::Deliver);
        self.transition(AppPhase::DeliverReady);

        let last = self.last_commit_id();
        let app_hash = if last.is_zero() {
            Sha256::digest(b"").to_vec()
        } else {
            last.hash.to_vec()
        };

        let Some(init_chainer) = self.callbacks.init_chainer.clone() else {
            return Ok(ResponseInitChain {
                consensus_params: None,
                app_hash,
            });
        };

        let mut res = ResponseInitChain::default();
        for kind in [
            StateKind::Deliver,
            StateKind::PrepareProposal,
            StateKind::ProcessProposal,
            StateKind::Check,
        ] {
            let Some(state) = self.state_mut(kind) else {
                continue;
            };
            let out = init_chainer(state.ctx_mut(), req)?;
            state.ctx_mut().event_manager_mut().take();
            // Proposal resets return to genesis state, not to an empty branch.
            state.checkpoint();
            if kind == StateKind::Deliver {
                res = out;
            }
        }

        info!(
            chain_id = %self.chain_id,
            initial_height = self.initial_height,
            "initialized chain"
        );
        res.app_hash = app_hash;
        Ok(res)
    }

    /// Checks that `height` is the next height to execute.
    pub fn validate_height(&self, height: i64) -> Result<()> {
        if height < 1 {
            return Err(Error::InvalidHeight(height.to_string()));
        }
        let last = self.last_block_height();
        let expected = if last == 0 && self.initial_height > 1 {
            self.initial_height
        } else {
            last + 1
        };
        if height != expected {
            return Err(Error::InvalidHeight(format!("{height}; expected: {expected}")));
        }
        Ok(())
    }

    pub fn begin_block(&mut self, req: &RequestBeginBlock) -> Result<ResponseBeginBlock> {
        if !self.chain_id.is_empty() && req.header.chain_id != self.chain_id {
            return Err(Error::InvalidRequest(format!(
                "invalid chain-id on BeginBlock; expected: {}, got: {}",
                self.chain_id, req.header.chain_id
            )));
        }
        self.validate_height(req.header.height)?;

        self.vote_infos = Arc::new(req.votes.clone());
        let state = self.ensure_state(StateKind::Deliver, req.header.clone());
        state.ctx_mut().set_header_hash(req.hash.clone());
        self.refresh_consensus_params(StateKind::Deliver)?;
        self.state_to_commit = Some(StateKind::Deliver);
        self.transition(AppPhase::DeliverReady);

        let mut res = ResponseBeginBlock::default();
        if let (Some(begin_blocker), Some(state)) = (self.callbacks.begin_blocker.clone(), self.deliver_state.as_mut()) {
            res = begin_blocker(state.ctx_mut(), req);
            res.events = mark_events_to_index(res.events, &self.config.index_events);
        }
        Ok(res)
    }

    /// Runs the mid-block hook between the transactions and EndBlock.
    pub fn mid_block(&mut self, height: i64) -> Vec<Event> {
        match (self.callbacks.mid_blocker.clone(), self.deliver_state.as_mut()) {
            (Some(mid_blocker), Some(state)) => {
                mark_events_to_index(mid_blocker(state.ctx_mut(), height), &self.config.index_events)
            }
            _ => Vec::new(),
        }
    }

    pub fn end_block(&mut self, req: &RequestEndBlock) -> Result<ResponseEndBlock> {
        let Some(state) = self.deliver_state.as_mut() else {
            return Err(Error::InvalidRequest("EndBlock called before BeginBlock".into()));
        };
        state.ctx_mut().event_manager_mut().take();

        let mut res = match &self.callbacks.end_blocker {
            Some(end_blocker) => end_blocker(state.ctx_mut(), req),
            None => ResponseEndBlock::default(),
        };
        res.events = mark_events_to_index(res.events, &self.config.index_events);
        res.consensus_param_updates = match &self.deliver_state {
            Some(state) => self.get_consensus_params(state.ctx())?,
            None => None,
        };
        Ok(res)
    }

    /// Validates a transaction for the mempool.
    ///
    /// Only the ante phase runs; on success its writes persist in the Check
    /// state so later transactions from the same sender see them.
    pub fn check_tx(&self, req: &RequestCheckTx) -> ResponseCheckTxV2 {
        let tx = match (self.tx_decoder)(&req.tx) {
            Ok(tx) => tx,
            Err(err) => return check_tx_error(&err, GasInfo::default()),
        };
        let mode = match req.kind {
            CheckTxType::New => ExecMode::Check,
            CheckTxType::Recheck => ExecMode::ReCheck,
        };

        let mut guard = self.check_state.write();
        let Some(state) = guard.as_mut() else {
            let err = Error::InvalidRequest("CheckTx called before InitChain".into());
            return check_tx_error(&err, GasInfo::default());
        };
        let mut ctx = state.ctx().derive(state.ctx().store().branch());
        ctx.set_mode(mode);
        ctx.set_tx_checksum(tx_checksum(&req.tx));

        let output = self.runner.run_tx(&mut ctx, tx.as_ref());
        let result = match output.result {
            Ok(result) => result,
            Err(err) => return check_tx_error(&err, output.gas_info),
        };

        let checker = ctx.pending_tx_checker().cloned();
        let expire_handler = ctx.expire_tx_handler().cloned();
        let evm_tx_info = ctx.evm_tx_info().cloned();
        let priority = ctx.priority();
        if let Err(err) = state.ctx_mut().store_mut().write(ctx.into_store()) {
            return check_tx_error(&err.into(), output.gas_info);
        }

        ResponseCheckTxV2 {
            response: ResponseCheckTx {
                gas_wanted: output.gas_info.gas_wanted,
                gas_used: output.gas_info.gas_used,
                data: result.data,
                log: result.log,
                events: mark_events_to_index(result.events, &self.config.index_events),
                priority,
                ..ResponseCheckTx::default()
            },
            is_pending: checker.is_some(),
            checker,
            expire_handler,
            evm_tx_info,
        }
    }

    /// Runs a transaction over a throwaway branch of the Check state.
    pub fn simulate(&self, tx_bytes: &[u8]) -> Result<(GasInfo, TxResult)> {
        let tx = (self.tx_decoder)(tx_bytes)?;
        let mut ctx = {
            let guard = self.check_state.read();
            let Some(state) = guard.as_ref() else {
                return Err(Error::InvalidRequest("simulate called before InitChain".into()));
            };
            state.ctx().derive(state.ctx().store().branch())
        };
        ctx.set_mode(ExecMode::Simulate);
        ctx.set_tx_checksum(tx_checksum(tx_bytes));

        let output = self.runner.run_tx(&mut ctx, tx.as_ref());
        output.result.map(|result| (output.gas_info, result))
    }

    /// Executes a single transaction against the Deliver state.
    pub fn deliver_tx(&mut self, tx_bytes: &[u8], index: usize) -> ResponseDeliverTx {
        let entry = TxEntry::decode(index, tx_bytes, &self.tx_decoder);
        let Some(state) = self.deliver_state.as_mut() else {
            let err = Error::InvalidRequest("DeliverTx called before BeginBlock".into());
            return ResponseDeliverTx::from_error(&err, GasInfo::default(), Vec::new());
        };
        let deliver = state.ctx_mut();

        let mut ctx = deliver.derive(deliver.store().branch());
        let response = self.runner.deliver_tx(&mut ctx, &entry);
        if let Err(err) = deliver.store_mut().write(ctx.into_store()) {
            return ResponseDeliverTx::from_error(&err.into(), GasInfo::default(), Vec::new());
        }
        self.runner.run_deliver_hooks(deliver, &entry, &response);
        deliver.store().reset_events();
        response
    }

    /// Executes a block's transactions with the configured batch executor.
    ///
    /// Results are in input order and the Deliver state ends up as if the
    /// transactions had run one after another.
    pub fn deliver_tx_batch(&mut self, req: &RequestDeliverTxBatch) -> Result<ResponseDeliverTxBatch> {
        if req.txs.is_empty() {
            return Ok(ResponseDeliverTxBatch::default());
        }
        let Some(state) = self.deliver_state.as_mut() else {
            return Err(Error::InvalidRequest("DeliverTxBatch called before BeginBlock".into()));
        };

        let entries: Vec<TxEntry> = req
            .txs
            .iter()
            .enumerate()
            .map(|(index, bytes)| TxEntry::decode(index, bytes, &self.tx_decoder))
            .collect();
        let output = self.executor.execute(&self.runner, state.ctx_mut(), &entries)?;
        debug!(
            executor = self.executor.name(),
            txs = output.stats.txs,
            failed = output.failed(),
            executions = output.stats.executions,
            "delivered batch"
        );

        Ok(ResponseDeliverTxBatch {
            results: output.responses,
        })
    }

    /// BeginBlock, transactions and EndBlock in one call.
    ///
    /// A registered finalize blocker replaces the default sequence.
    pub fn finalize_block(&mut self, req: &RequestFinalizeBlock) -> Result<ResponseFinalizeBlock> {
        self.validate_height(req.height)?;
        self.vote_infos = Arc::new(req.decided_last_commit.clone());

        if let Some(finalize_blocker) = self.callbacks.finalize_blocker.clone() {
            let res = finalize_blocker(self, req)?;
            self.transition(AppPhase::FinalizeActive);
            return Ok(res);
        }

        let header = Header {
            chain_id: self.chain_id.clone(),
            height: req.height,
            time: req.time,
            proposer_address: req.proposer_address.clone(),
            app_hash: self.last_commit_id().hash.to_vec(),
        };
        let begin = self.begin_block(&RequestBeginBlock {
            hash: req.hash.clone(),
            header,
            votes: req.decided_last_commit.clone(),
        })?;
        self.transition(AppPhase::FinalizeActive);
        let batch = self.deliver_tx_batch(&RequestDeliverTxBatch {
            txs: req.txs.clone(),
        })?;

        let mut events = begin.events;
        events.extend(self.mid_block(req.height));
        let end = self.end_block(&RequestEndBlock { height: req.height })?;
        events.extend(end.events);
        self.set_deliver_state_to_commit();

        Ok(ResponseFinalizeBlock {
            events,
            tx_results: batch.results,
            consensus_param_updates: end.consensus_param_updates,
            app_hash: self.get_working_hash().to_vec(),
        })
    }

    pub fn prepare_proposal(&mut self, req: &RequestPrepareProposal) -> Result<ResponsePrepareProposal> {
        let Some(handler) = self.callbacks.prepare_proposal.clone() else {
            return Err(Error::InvalidRequest("no prepare proposal handler".into()));
        };
        let header = self.proposal_header(req.height, req.time, &req.proposer_address);
        self.transition(AppPhase::PrepareProposalActive);

        let state = self.ensure_state(StateKind::PrepareProposal, header);
        state.reset();
        state.ctx_mut().set_vote_infos(Arc::new(req.local_last_commit.clone()));
        self.refresh_consensus_params(StateKind::PrepareProposal)?;
        let Some(state) = self.prepare_proposal_state.as_mut() else {
            return Err(Error::InvalidRequest("prepare proposal state missing".into()));
        };

        let ctx = state.ctx_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, req))) {
            Ok(res) => res,
            Err(_) => {
                error!(height = req.height, "panic recovered in PrepareProposal");
                Ok(ResponsePrepareProposal {
                    tx_records: req.txs.iter().cloned().map(TxRecord::unmodified).collect(),
                })
            }
        }
    }

    pub fn process_proposal(&mut self, req: &RequestProcessProposal) -> Result<ResponseProcessProposal> {
        let Some(handler) = self.callbacks.process_proposal.clone() else {
            return Err(Error::InvalidRequest("no process proposal handler".into()));
        };
        let header = self.proposal_header(req.height, req.time, &req.proposer_address);
        self.transition(AppPhase::ProcessProposalActive);

        let state = self.ensure_state(StateKind::ProcessProposal, header);
        state.reset();
        state.ctx_mut().set_header_hash(req.hash.clone());
        state.ctx_mut().set_vote_infos(Arc::new(req.proposed_last_commit.clone()));
        self.refresh_consensus_params(StateKind::ProcessProposal)?;
        let Some(state) = self.process_proposal_state.as_mut() else {
            return Err(Error::InvalidRequest("process proposal state missing".into()));
        };

        let ctx = state.ctx_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, req))) {
            Ok(res) => res,
            Err(_) => {
                error!(height = req.height, "panic recovered in ProcessProposal");
                Ok(ResponseProcessProposal {
                    status: ProposalStatus::Reject,
                })
            }
        }
    }

    fn proposal_header(&self, height: i64, time: u64, proposer: &[u8]) -> Header {
        Header {
            chain_id: self.chain_id.clone(),
            height,
            time,
            proposer_address: proposer.to_vec(),
            app_hash: self.last_commit_id().hash.to_vec(),
        }
    }

    /// Writes the pending state to the root store and commits it.
    ///
    /// # Panics
    ///
    /// If neither FinalizeBlock nor BeginBlock has selected a state to commit.
    pub fn commit(&mut self) -> Result<ResponseCommit> {
        let lock = self.commit_lock.clone();
        let _guard = lock.lock();

        let retain_height = match self.pending_state() {
            Some(state) => self.get_block_retention_height(state.ctx().block_height()),
            None => panic!("no state to commit"),
        };
        let state = match self.state_to_commit.take() {
            Some(StateKind::Deliver) => self.deliver_state.take(),
            Some(StateKind::ProcessProposal) => self.process_proposal_state.take(),
            _ => None,
        };
        let Some(state) = state else {
            panic!("no state to commit");
        };
        let header = state.ctx().header().clone();

        self.cms.write(state.into_store())?;
        let commit_id = self.cms.commit();
        info!(
            height = commit_id.version,
            hash = %hex::encode(commit_id.hash),
            "committed state"
        );
        if retain_height > 0 {
            self.cms.prune_versions(retain_height);
        }
        self.transition(AppPhase::Committed);

        self.set_state(StateKind::Check, header.clone());
        self.refresh_consensus_params(StateKind::Check)?;
        self.deliver_state = None;
        self.prepare_proposal_state = None;
        self.process_proposal_state = None;

        let dropped = self.drop_bundles_at_and_below(header.height);
        if dropped > 0 {
            debug!(height = header.height, dropped, "dropped bundles");
        }

        let halt_at_height = self.config.halt_height > 0 && header.height as u64 >= self.config.halt_height;
        let halt_at_time = self.config.halt_time > 0 && header.time >= self.config.halt_time;
        if halt_at_height || halt_at_time {
            self.halt(header.height);
        }

        if self.config.snapshot_interval > 0 && (header.height as u64) % self.config.snapshot_interval == 0 {
            self.snapshot(header.height as u64);
        }

        self.transition(AppPhase::CheckReady);
        Ok(ResponseCommit { retain_height })
    }

    fn snapshot(&self, height: u64) {
        let Some(manager) = &self.snapshot_manager else {
            return;
        };
        let mut task = self.snapshot_task.lock();
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            warn!(height, "previous snapshot still running; skipping");
            return;
        }
        if let Some(done) = task.take() {
            done.join();
        }
        *task = Some(SnapshotTask::spawn(
            manager.clone(),
            height,
            self.config.snapshot_keep_recent,
        ));
    }

    /// Oldest height the node must keep to serve evidence, snapshots and
    /// the configured minimum; `0` keeps everything.
    pub fn get_block_retention_height(&self, commit_height: i64) -> i64 {
        if self.config.min_retain_blocks == 0 {
            return 0;
        }
        let params = self.pending_state().and_then(|state| state.ctx().consensus_params());
        retention_height(
            commit_height,
            params,
            self.config.snapshot_interval,
            self.config.snapshot_keep_recent,
            self.config.min_retain_blocks,
        )
    }

    /// Stops any running snapshot. Waits for an in-flight Commit first.
    pub fn close(&self) {
        let lock = self.commit_lock.clone();
        let _guard = lock.lock();
        if let Some(task) = self.snapshot_task.lock().take() {
            task.cancel();
        }
        info!(name = %self.name, "application closed");
    }

    // ============================================================================
    // State sync
    // ============================================================================

    pub fn list_snapshots(&self) -> ResponseListSnapshots {
        let Some(manager) = &self.snapshot_manager else {
            return ResponseListSnapshots::default();
        };
        match manager.list() {
            Ok(snapshots) => ResponseListSnapshots { snapshots },
            Err(err) => {
                error!(%err, "failed to list snapshots");
                ResponseListSnapshots::default()
            }
        }
    }

    pub fn offer_snapshot(&self, req: &RequestOfferSnapshot) -> OfferSnapshotResult {
        let Some(manager) = &self.snapshot_manager else {
            error!("snapshot manager not configured");
            return OfferSnapshotResult::Abort;
        };
        let Some(snapshot) = req.snapshot.clone() else {
            error!("received nil snapshot");
            return OfferSnapshotResult::Reject;
        };
        let (height, format) = (snapshot.height, snapshot.format);

        match manager.restore(snapshot) {
            Ok(()) => {
                info!(height, format, "restoring snapshot");
                OfferSnapshotResult::Accept
            }
            Err(SnapshotError::UnknownFormat(_)) => OfferSnapshotResult::RejectFormat,
            Err(err @ SnapshotError::InvalidMetadata(_)) => {
                error!(height, format, %err, "rejecting invalid snapshot");
                OfferSnapshotResult::Reject
            }
            Err(err) => {
                error!(height, format, %err, "failed to restore snapshot");
                OfferSnapshotResult::Abort
            }
        }
    }

    pub fn load_snapshot_chunk(&self, req: &RequestLoadSnapshotChunk) -> ResponseLoadSnapshotChunk {
        let Some(manager) = &self.snapshot_manager else {
            return ResponseLoadSnapshotChunk::default();
        };
        match manager.load_chunk(req.height, req.format, req.chunk) {
            Ok(chunk) => ResponseLoadSnapshotChunk { chunk },
            Err(err) => {
                error!(height = req.height, format = req.format, chunk = req.chunk, %err, "failed to load snapshot chunk");
                ResponseLoadSnapshotChunk::default()
            }
        }
    }

    pub fn apply_snapshot_chunk(&self, req: &RequestApplySnapshotChunk) -> ResponseApplySnapshotChunk {
        let Some(manager) = &self.snapshot_manager else {
            error!("snapshot manager not configured");
            return ResponseApplySnapshotChunk {
                result: ApplySnapshotChunkResult::Abort,
                ..ResponseApplySnapshotChunk::default()
            };
        };

        match manager.restore_chunk(req.chunk.clone()) {
            Ok(done) => {
                if done {
                    info!("snapshot restore complete");
                }
                ResponseApplySnapshotChunk {
                    result: ApplySnapshotChunkResult::Accept,
                    ..ResponseApplySnapshotChunk::default()
                }
            }
            Err(SnapshotError::ChunkHashMismatch) => {
                error!(chunk = req.index, sender = %req.sender, "chunk checksum mismatch; rejecting sender and requesting refetch");
                ResponseApplySnapshotChunk {
                    result: ApplySnapshotChunkResult::Retry,
                    refetch_chunks: vec![req.index],
                    reject_senders: vec![req.sender.clone()],
                }
            }
            Err(err) => {
                error!(%err, "failed to restore snapshot");
                ResponseApplySnapshotChunk {
                    result: ApplySnapshotChunkResult::Abort,
                    ..ResponseApplySnapshotChunk::default()
                }
            }
        }
    }
}

fn check_tx_error(err: &Error, gas: GasInfo) -> ResponseCheckTxV2 {
    let (codespace, code) = err.abci_info();
    ResponseCheckTxV2 {
        response: ResponseCheckTx {
            code,
            codespace: codespace.to_string(),
            log: err.to_string(),
            gas_wanted: gas.gas_wanted,
            gas_used: gas.gas_used,
            ..ResponseCheckTx::default()
        },
        is_pending: false,
        checker: None,
        expire_handler: None,
        evm_tx_info: None,
    }
}

/// Smallest non-zero candidate among the evidence window, the snapshot
/// window and the configured minimum; non-positive results become `0`.
fn retention_height(
    commit_height: i64,
    params: Option<&ConsensusParams>,
    snapshot_interval: u64,
    keep_recent: u32,
    min_retain_blocks: u64,
) -> i64 {
    fn min_non_zero(x: i64, y: i64) -> i64 {
        match (x, y) {
            (0, y) => y,
            (x, 0) => x,
            (x, y) => x.min(y),
        }
    }

    let mut retain = 0;
    if let Some(evidence) = params.and_then(|params| params.evidence.as_ref()) {
        if evidence.max_age_num_blocks > 0 {
            retain = commit_height - evidence.max_age_num_blocks;
        }
    }
    if snapshot_interval > 0 && keep_recent > 0 {
        retain = min_non_zero(retain, commit_height - (snapshot_interval * keep_recent as u64) as i64);
    }
    retain = min_non_zero(retain, commit_height - min_retain_blocks as i64);
    retain.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::params::EvidenceParams;

    fn evidence(max_age_num_blocks: i64) -> ConsensusParams {
        ConsensusParams {
            evidence: Some(EvidenceParams {
                max_age_num_blocks,
                ..EvidenceParams::default()
            }),
            ..ConsensusParams::default()
        }
    }

    #[test]
    fn test_retention_height() {
        // Only the configured minimum.
        assert_eq!(retention_height(1000, None, 0, 0, 100), 900);
        // Evidence window is tighter.
        assert_eq!(retention_height(1000, Some(&evidence(50)), 0, 0, 100), 900);
        assert_eq!(retention_height(1000, Some(&evidence(500)), 0, 0, 100), 500);
        // Snapshot window.
        assert_eq!(retention_height(1000, None, 100, 3, 10), 700);
        // Everything is retained early in the chain.
        assert_eq!(retention_height(50, Some(&evidence(500)), 0, 0, 100), 0);
    }

    #[test]
    fn test_check_tx_error_response() {
        let res = check_tx_error(
            &Error::TxDecode("bad bytes".into()),
            GasInfo::default(),
        );
        assert_eq!(res.response.code, 2);
        assert_eq!(res.response.codespace, "sdk");
        assert!(!res.is_pending);
    }
}
