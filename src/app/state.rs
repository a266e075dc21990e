//! Long-lived per-phase state.

use crate::context::{Context, ExecMode, Header};
use crate::store::CacheMultiStore;
use std::fmt;

/// Which long-lived branch a [`BranchedState`] backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Check,
    Deliver,
    PrepareProposal,
    ProcessProposal,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateKind::Check => "check",
            StateKind::Deliver => "deliver",
            StateKind::PrepareProposal => "prepare_proposal",
            StateKind::ProcessProposal => "process_proposal",
        })
    }
}

/// A branch of committed state plus the context executing against it.
///
/// The checkpoint is a copy of the branch taken when the state was created
/// (or last [`checkpoint`](Self::checkpoint)ed); [`reset`](Self::reset)
/// returns to it so repeated proposal calls for one height start clean.
pub struct BranchedState {
    kind: StateKind,
    ctx: Context,
    checkpoint: CacheMultiStore,
}

impl BranchedState {
    pub fn new(kind: StateKind, ms: CacheMultiStore, header: Header) -> Self {
        let mode = match kind {
            StateKind::Check => ExecMode::Check,
            _ => ExecMode::Deliver,
        };
        let checkpoint = ms.fork();
        Self {
            kind,
            ctx: Context::new(ms, header, mode),
            checkpoint,
        }
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn into_store(self) -> CacheMultiStore {
        self.ctx.into_store()
    }

    pub fn set_header(&mut self, header: Header) {
        self.ctx.set_header(header);
    }

    /// Makes the current contents the state [`reset`](Self::reset) returns to.
    pub fn checkpoint(&mut self) {
        self.checkpoint = self.ctx.store().fork();
    }

    /// Drops everything written since the checkpoint, along with buffered
    /// events and the access log.
    pub fn reset(&mut self) {
        self.ctx.replace_store(self.checkpoint.fork());
        self.ctx.event_manager_mut().take();
    }
}

impl fmt::Debug for BranchedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchedState")
            .field("kind", &self.kind)
            .field("height", &self.ctx.block_height())
            .finish()
    }
}
