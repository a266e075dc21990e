//! The application: phase state machine, callbacks and wiring.
//!
//! [`BaseApp`] owns the root store and four long-lived [`BranchedState`]s
//! (Check, Deliver, PrepareProposal, ProcessProposal). The ABCI methods in
//! [`abci`] move it through its phases; transactions run through the
//! [`TxRunner`] pipeline, batches through a [`BatchExecutor`].

pub mod abci;
pub mod params;
pub mod query;
pub mod snapshot;
pub mod state;
pub mod types;

use self::params::{ConsensusParams, ParamStore};
use self::snapshot::{SnapshotManager, SnapshotTask};
use self::state::{BranchedState, StateKind};
use self::types::*;
use crate::acl::{AnteDependencyGenerator, DependencyGenerator, MsgValidator};
use crate::bundle::BundleStore;
use crate::config::AppConfig;
use crate::context::{Context, Header, VoteInfo};
use crate::error::Result;
use crate::events::Event;
use crate::executor::{self, BatchExecutor};
use crate::pipeline::{DeliverTxHook, TxRunner};
use crate::recovery::RecoveryHandler;
use crate::router::{AnteHandler, MsgHandler, Querier, QueryRouter};
use crate::store::{CommitId, CommitMultiStore, StoreKey};
use crate::tx::TxDecoder;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub type InitChainer = Arc<dyn Fn(&mut Context, &RequestInitChain) -> Result<ResponseInitChain> + Send + Sync>;
pub type BeginBlocker = Arc<dyn Fn(&mut Context, &RequestBeginBlock) -> ResponseBeginBlock + Send + Sync>;
pub type MidBlocker = Arc<dyn Fn(&mut Context, i64) -> Vec<Event> + Send + Sync>;
pub type EndBlocker = Arc<dyn Fn(&mut Context, &RequestEndBlock) -> ResponseEndBlock + Send + Sync>;
/// Replaces the default BeginBlock, DeliverTxBatch, EndBlock sequence.
pub type FinalizeBlocker =
    Arc<dyn Fn(&mut BaseApp, &RequestFinalizeBlock) -> Result<ResponseFinalizeBlock> + Send + Sync>;
pub type PrepareProposalHandler =
    Arc<dyn Fn(&mut Context, &RequestPrepareProposal) -> Result<ResponsePrepareProposal> + Send + Sync>;
pub type ProcessProposalHandler =
    Arc<dyn Fn(&mut Context, &RequestProcessProposal) -> Result<ResponseProcessProposal> + Send + Sync>;
/// Called with the committed height once a halt condition is met.
pub type HaltHandler = Arc<dyn Fn(i64) + Send + Sync>;

/// Lifecycle phase of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Uninitialized,
    CheckReady,
    DeliverReady,
    PrepareProposalActive,
    ProcessProposalActive,
    FinalizeActive,
    Committed,
}

#[derive(Clone, Default)]
struct Callbacks {
    init_chainer: Option<InitChainer>,
    begin_blocker: Option<BeginBlocker>,
    mid_blocker: Option<MidBlocker>,
    end_blocker: Option<EndBlocker>,
    finalize_blocker: Option<FinalizeBlocker>,
    prepare_proposal: Option<PrepareProposalHandler>,
    process_proposal: Option<ProcessProposalHandler>,
}

struct Parts {
    name: String,
    config: AppConfig,
    cms: Box<dyn CommitMultiStore>,
    tx_decoder: TxDecoder,
    runner: TxRunner,
    executor: Option<Box<dyn BatchExecutor>>,
    callbacks: Callbacks,
    query_router: QueryRouter,
    param_store: Option<Arc<dyn ParamStore>>,
    snapshot_manager: Option<Arc<dyn SnapshotManager>>,
    halt_handler: Option<HaltHandler>,
}

/// Wires a [`BaseApp`]. Once [`build`](Self::build) has run the builder is
/// sealed and every further call panics.
pub struct BaseAppBuilder {
    parts: Option<Parts>,
}

impl BaseAppBuilder {
    pub fn new(name: &str, cms: impl CommitMultiStore + 'static, tx_decoder: TxDecoder) -> Self {
        Self {
            parts: Some(Parts {
                name: name.to_string(),
                config: AppConfig::default(),
                cms: Box::new(cms),
                tx_decoder,
                runner: TxRunner::default(),
                executor: None,
                callbacks: Callbacks::default(),
                query_router: QueryRouter::new(),
                param_store: None,
                snapshot_manager: None,
                halt_handler: None,
            }),
        }
    }

    fn parts(&mut self) -> &mut Parts {
        match self.parts.as_mut() {
            Some(parts) => parts,
            None => panic!("cannot modify a sealed BaseApp"),
        }
    }

    pub fn config(&mut self, config: AppConfig) -> &mut Self {
        self.parts().config = config;
        self
    }

    pub fn mount_store(&mut self, name: &str) -> &mut Self {
        self.parts().cms.mount_store(StoreKey::new(name));
        self
    }

    pub fn ante_handler(&mut self, handler: Arc<dyn AnteHandler>) -> &mut Self {
        self.parts().runner.ante_handler = Some(handler);
        self
    }

    pub fn msg_handler(&mut self, type_url: &str, handler: MsgHandler) -> &mut Self {
        self.parts().runner.msg_router.register(type_url, handler);
        self
    }

    pub fn legacy_route(&mut self, route: &str, handler: MsgHandler) -> &mut Self {
        self.parts().runner.legacy_router.add_route(route, handler);
        self
    }

    pub fn query_route(&mut self, route: &str, querier: Querier) -> &mut Self {
        self.parts().query_router.add_route(route, querier);
        self
    }

    pub fn dependency_generator(&mut self, type_url: &str, generator: DependencyGenerator) -> &mut Self {
        self.parts().runner.access_control.register(type_url, generator);
        self
    }

    pub fn ante_dependency_generator(&mut self, generator: AnteDependencyGenerator) -> &mut Self {
        self.parts().runner.access_control.set_ante_generator(generator);
        self
    }

    pub fn recovery_handler(&mut self, handler: RecoveryHandler) -> &mut Self {
        self.parts().runner.recovery.push(handler);
        self
    }

    pub fn deliver_tx_hook(&mut self, hook: DeliverTxHook) -> &mut Self {
        self.parts().runner.deliver_tx_hooks.push(hook);
        self
    }

    pub fn init_chainer(&mut self, handler: InitChainer) -> &mut Self {
        self.parts().callbacks.init_chainer = Some(handler);
        self
    }

    pub fn begin_blocker(&mut self, handler: BeginBlocker) -> &mut Self {
        self.parts().callbacks.begin_blocker = Some(handler);
        self
    }

    pub fn mid_blocker(&mut self, handler: MidBlocker) -> &mut Self {
        self.parts().callbacks.mid_blocker = Some(handler);
        self
    }

    pub fn end_blocker(&mut self, handler: EndBlocker) -> &mut Self {
        self.parts().callbacks.end_blocker = Some(handler);
        self
    }

    pub fn finalize_blocker(&mut self, handler: FinalizeBlocker) -> &mut Self {
        self.parts().callbacks.finalize_blocker = Some(handler);
        self
    }

    pub fn prepare_proposal_handler(&mut self, handler: PrepareProposalHandler) -> &mut Self {
        self.parts().callbacks.prepare_proposal = Some(handler);
        self
    }

    pub fn process_proposal_handler(&mut self, handler: ProcessProposalHandler) -> &mut Self {
        self.parts().callbacks.process_proposal = Some(handler);
        self
    }

    pub fn param_store(&mut self, store: Arc<dyn ParamStore>) -> &mut Self {
        self.parts().param_store = Some(store);
        self
    }

    pub fn snapshot_manager(&mut self, manager: Arc<dyn SnapshotManager>) -> &mut Self {
        self.parts().snapshot_manager = Some(manager);
        self
    }

    pub fn halt_handler(&mut self, handler: HaltHandler) -> &mut Self {
        self.parts().halt_handler = Some(handler);
        self
    }

    /// Overrides the executor picked from the configuration.
    pub fn batch_executor(&mut self, executor: Box<dyn BatchExecutor>) -> &mut Self {
        self.parts().executor = Some(executor);
        self
    }

    /// Seals the builder, loads the latest version and returns the app.
    pub fn build(&mut self) -> Result<BaseApp> {
        let Parts {
            name,
            config,
            mut cms,
            tx_decoder,
            mut runner,
            executor,
            callbacks,
            query_router,
            param_store,
            snapshot_manager,
            halt_handler,
        } = match self.parts.take() {
            Some(parts) => parts,
            None => panic!("BaseApp already built"),
        };

        config.validate()?;
        cms.load_version(0)?;
        if config.trace {
            cms.set_trace_context(Default::default());
        }
        runner.index_events = config.index_events.clone();
        runner.trace = config.trace;

        let executor = executor.unwrap_or_else(|| executor::from_config(&config));
        let last = cms.last_commit_id();
        let header = Header {
            chain_id: config.chain_id.clone(),
            height: last.version,
            ..Header::default()
        };
        let check_state = BranchedState::new(StateKind::Check, cms.cache_multi_store(), header);
        let phase = if last.version > 0 {
            AppPhase::CheckReady
        } else {
            AppPhase::Uninitialized
        };
        info!(
            name = %name,
            executor = executor.name(),
            workers = config.concurrency_workers,
            height = last.version,
            "application loaded"
        );

        Ok(BaseApp {
            name,
            chain_id: config.chain_id.clone(),
            initial_height: config.initial_height,
            msg_validator: config.access_validation.map(MsgValidator::new),
            config,
            cms,
            tx_decoder,
            runner,
            executor,
            callbacks,
            query_router,
            param_store,
            snapshot_manager,
            halt_handler,
            check_state: RwLock::new(Some(check_state)),
            deliver_state: None,
            prepare_proposal_state: None,
            process_proposal_state: None,
            state_to_commit: None,
            vote_infos: Arc::new(Vec::new()),
            phase,
            bundles: Mutex::new(BundleStore::new()),
            snapshot_task: Mutex::new(None),
            commit_lock: Arc::new(Mutex::new(())),
            halted: AtomicBool::new(false),
        })
    }
}

pub struct BaseApp {
    name: String,
    config: AppConfig,
    cms: Box<dyn CommitMultiStore>,
    tx_decoder: TxDecoder,
    runner: TxRunner,
    executor: Box<dyn BatchExecutor>,
    callbacks: Callbacks,
    query_router: QueryRouter,
    param_store: Option<Arc<dyn ParamStore>>,
    snapshot_manager: Option<Arc<dyn SnapshotManager>>,
    halt_handler: Option<HaltHandler>,
    msg_validator: Option<MsgValidator>,
    chain_id: String,
    initial_height: i64,

    // Queries read the check state while CheckTx writes it.
    check_state: RwLock<Option<BranchedState>>,
    deliver_state: Option<BranchedState>,
    prepare_proposal_state: Option<BranchedState>,
    process_proposal_state: Option<BranchedState>,
    state_to_commit: Option<StateKind>,
    vote_infos: Arc<Vec<VoteInfo>>,
    phase: AppPhase,

    bundles: Mutex<BundleStore>,
    snapshot_task: Mutex<Option<SnapshotTask>>,
    // Shared by Commit and Close.
    commit_lock: Arc<Mutex<()>>,
    halted: AtomicBool,
}

impl fmt::Debug for BaseApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseApp")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("last_block_height", &self.last_block_height())
            .field("executor", &self.executor.name())
            .finish_non_exhaustive()
    }
}

impl BaseApp {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn phase(&self) -> AppPhase {
        self.phase
    }

    pub fn last_commit_id(&self) -> CommitId {
        self.cms.last_commit_id()
    }

    pub fn last_block_height(&self) -> i64 {
        self.cms.last_commit_id().version
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn commit_multi_store(&self) -> &dyn CommitMultiStore {
        self.cms.as_ref()
    }

    /// Runs `f` on the Check context, if there is one.
    pub fn with_check_ctx<R>(&self, f: impl FnOnce(&Context) -> R) -> Option<R> {
        self.check_state.read().as_ref().map(|state| f(state.ctx()))
    }

    pub fn deliver_ctx(&self) -> Option<&Context> {
        self.deliver_state.as_ref().map(BranchedState::ctx)
    }

    pub fn deliver_ctx_mut(&mut self) -> Option<&mut Context> {
        self.deliver_state.as_mut().map(BranchedState::ctx_mut)
    }

    pub fn prepare_proposal_ctx(&self) -> Option<&Context> {
        self.prepare_proposal_state.as_ref().map(BranchedState::ctx)
    }

    pub fn process_proposal_ctx(&self) -> Option<&Context> {
        self.process_proposal_state.as_ref().map(BranchedState::ctx)
    }

    // ============================================================================
    // Bundles
    // ============================================================================

    pub fn submit_bundle(&self, height: i64, txs: Vec<Vec<u8>>) {
        self.bundles.lock().submit_bundle(height, txs);
    }

    pub fn bundle_at(&self, height: i64) -> Vec<Vec<u8>> {
        self.bundles.lock().bundle_at(height).to_vec()
    }

    pub fn drop_bundles_at_and_below(&self, height: i64) -> usize {
        self.bundles.lock().drop_bundles_at_and_below(height)
    }

    // ============================================================================
    // Consensus params
    // ============================================================================

    /// Loads the consensus params visible to `ctx`; `None` without a param store.
    pub fn get_consensus_params(&self, ctx: &Context) -> Result<Option<ConsensusParams>> {
        match &self.param_store {
            Some(store) => ConsensusParams::load(store.as_ref(), ctx).map(Some),
            None => Ok(None),
        }
    }

    /// # Panics
    ///
    /// Without a param store.
    pub fn store_consensus_params(&self, ctx: &mut Context, params: &ConsensusParams) -> Result<()> {
        match &self.param_store {
            Some(store) => params.store(store.as_ref(), ctx),
            None => panic!("cannot store consensus params with no params store set"),
        }
    }

    // ============================================================================
    // Phase states
    // ============================================================================

    fn transition(&mut self, next: AppPhase) {
        if self.phase != next {
            debug!(from = ?self.phase, to = ?next, "phase transition");
            self.phase = next;
        }
    }

    fn new_state(&self, kind: StateKind, header: Header) -> BranchedState {
        let mut state = BranchedState::new(kind, self.cms.cache_multi_store(), header);
        if kind != StateKind::Check {
            state.ctx_mut().set_msg_validator(self.msg_validator);
        }
        state
    }

    fn set_state(&mut self, kind: StateKind, header: Header) {
        let state = self.new_state(kind, header);
        match kind {
            StateKind::Check => *self.check_state.write() = Some(state),
            StateKind::Deliver => self.deliver_state = Some(state),
            StateKind::PrepareProposal => self.prepare_proposal_state = Some(state),
            StateKind::ProcessProposal => self.process_proposal_state = Some(state),
        }
    }

    fn state_mut(&mut self, kind: StateKind) -> Option<&mut BranchedState> {
        match kind {
            StateKind::Check => self.check_state.get_mut().as_mut(),
            StateKind::Deliver => self.deliver_state.as_mut(),
            StateKind::PrepareProposal => self.prepare_proposal_state.as_mut(),
            StateKind::ProcessProposal => self.process_proposal_state.as_mut(),
        }
    }

    /// Re-headers the state of `kind`, creating it first when absent.
    fn ensure_state(&mut self, kind: StateKind, header: Header) -> &mut BranchedState {
        if self.state_mut(kind).is_none() {
            self.set_state(kind, header.clone());
        }
        let vote_infos = self.vote_infos.clone();
        match self.state_mut(kind) {
            Some(state) => {
                state.set_header(header);
                state.ctx_mut().set_vote_infos(vote_infos);
                state
            }
            None => unreachable!("state {kind} was just created"),
        }
    }

    /// Loads the consensus params into the context of `kind`.
    fn refresh_consensus_params(&mut self, kind: StateKind) -> Result<()> {
        let param_store = self.param_store.clone();
        let Some(state) = self.state_mut(kind) else {
            return Ok(());
        };
        let params = match &param_store {
            Some(store) => Some(Arc::new(ConsensusParams::load(store.as_ref(), state.ctx())?)),
            None => None,
        };
        state.ctx_mut().set_consensus_params(params);
        Ok(())
    }

    pub fn set_deliver_state_to_commit(&mut self) {
        self.state_to_commit = Some(StateKind::Deliver);
    }

    pub fn set_process_proposal_state_to_commit(&mut self) {
        self.state_to_commit = Some(StateKind::ProcessProposal);
    }

    /// State the next Commit will write.
    fn pending_state(&self) -> Option<&BranchedState> {
        match self.state_to_commit {
            Some(StateKind::Deliver) => self.deliver_state.as_ref(),
            Some(StateKind::ProcessProposal) => self.process_proposal_state.as_ref(),
            _ => None,
        }
    }

    /// Hash the root store would commit to with the pending state applied.
    pub fn get_working_hash(&self) -> [u8; 32] {
        self.cms
            .working_hash(self.pending_state().map(|state| state.ctx().store()))
    }

    fn halt(&self, height: i64) {
        info!(
            height,
            halt_height = self.config.halt_height,
            halt_time = self.config.halt_time,
            "halting node per configuration"
        );
        self.halted.store(true, Ordering::Release);
        if let Some(handler) = &self.halt_handler {
            handler(height);
        }
    }
}
