//! Sequential batch executor.
//!
//! This is the baseline executor: it runs the pipeline for one transaction at
//! a time, each on a fresh branch of the Deliver context, and merges the
//! branch before moving on to the next.

use super::{BatchExecutor, BatchOutput, BatchStats};
use crate::context::Context;
use crate::error::Result;
use crate::pipeline::TxRunner;
use crate::tx::TxEntry;
use std::time::Instant;

/// Sequential executor that processes transactions one at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl BatchExecutor for SequentialExecutor {
    fn execute(&self, runner: &TxRunner, deliver: &mut Context, entries: &[TxEntry]) -> Result<BatchOutput> {
        let start = Instant::now();
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let mut ctx = deliver.derive(deliver.store().branch());
            let response = runner.deliver_tx(&mut ctx, entry);
            deliver.store_mut().write(ctx.into_store())?;
            runner.run_deliver_hooks(deliver, entry, &response);
            responses.push(response);
        }
        deliver.store().reset_events();

        Ok(BatchOutput {
            stats: BatchStats {
                txs: entries.len(),
                workers: 1,
                executions: entries.len(),
                duration: start.elapsed(),
                ..BatchStats::default()
            },
            responses,
        })
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
