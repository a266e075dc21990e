//! Per-transaction pipeline: ante phase, message dispatch, access validation.

use crate::acl::{AccessControl, MsgIndex};
use crate::app::types::ResponseDeliverTx;
use crate::context::{Context, ExecMode};
use crate::error::{Error, Result};
use crate::events::{mark_events_to_index, Event, ATTRIBUTE_KEY_ACTION, EVENT_TYPE_MESSAGE};
use crate::recovery::{panic_to_error, RecoveryChain};
use crate::router::{AnteHandler, LegacyRouter, MsgHandler, MsgServiceRouter};
use crate::store::TraceContext;
use crate::tx::{encode_msg_data, render_logs, GasInfo, MessageLog, Msg, MsgData, Tx, TxEntry, TxResult};
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Called after every successful Deliver transaction.
pub type DeliverTxHook = Arc<dyn Fn(&Context, &dyn Tx, [u8; 32], &ResponseDeliverTx) + Send + Sync>;

/// Outcome of [`TxRunner::run_tx`].
#[derive(Debug)]
pub struct RunTxOutput {
    pub gas_info: GasInfo,
    pub result: Result<TxResult>,
    pub ante_events: Vec<Event>,
    /// Message events accumulated before an access-validation failure.
    pub partial_events: Vec<Event>,
}

impl RunTxOutput {
    /// Events to report when the transaction failed.
    pub fn failure_events(&self) -> Vec<Event> {
        self.ante_events
            .iter()
            .chain(&self.partial_events)
            .cloned()
            .collect()
    }
}

/// Everything the pipeline needs, shared read-only by the scheduler workers.
#[derive(Clone, Default)]
pub struct TxRunner {
    pub(crate) ante_handler: Option<Arc<dyn AnteHandler>>,
    pub(crate) msg_router: MsgServiceRouter,
    pub(crate) legacy_router: LegacyRouter,
    pub(crate) recovery: RecoveryChain,
    pub(crate) access_control: AccessControl,
    pub(crate) deliver_tx_hooks: Vec<DeliverTxHook>,
    pub(crate) index_events: BTreeSet<String>,
    pub(crate) trace: bool,
}

impl fmt::Debug for TxRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRunner")
            .field("ante_handler", &self.ante_handler.is_some())
            .field("access_control", &self.access_control)
            .field("deliver_tx_hooks", &self.deliver_tx_hooks.len())
            .finish_non_exhaustive()
    }
}

impl TxRunner {
    /// Runs `tx` against `ctx`, which must be a transaction context of its own.
    ///
    /// On success the ante branch is always merged into `ctx`; the message
    /// branch is merged in Deliver mode only. Panics are caught here and every
    /// error goes through the recovery chain once.
    pub fn run_tx(&self, ctx: &mut Context, tx: &dyn Tx) -> RunTxOutput {
        let mut ante_events = Vec::new();
        let mut partial_events = Vec::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_tx_inner(ctx, tx, &mut ante_events, &mut partial_events)
        }))
        .unwrap_or_else(|payload| Err(panic_to_error(payload)));

        let gas_info = GasInfo {
            gas_wanted: ctx.gas_meter().limit(),
            gas_used: ctx.gas_meter().consumed(),
        };
        let result = result.map_err(|err| self.recovery.recover(err, gas_info));

        if ctx.mode() != ExecMode::Deliver {
            ctx.store().reset_events();
        }

        RunTxOutput {
            gas_info,
            result,
            ante_events,
            partial_events,
        }
    }

    fn run_tx_inner(
        &self,
        ctx: &mut Context,
        tx: &dyn Tx,
        ante_events: &mut Vec<Event>,
        partial_events: &mut Vec<Event>,
    ) -> Result<TxResult> {
        let msgs = tx.msgs();
        if msgs.is_empty() {
            return Err(Error::InvalidRequest("must contain at least one message".into()));
        }
        for msg in msgs {
            msg.validate_basic()?;
        }

        let validating = ctx.is_deliver() && ctx.msg_validator().is_some();
        if validating && ctx.access_ops().is_empty() {
            ctx.set_access_ops(self.access_control.tx_ops(tx));
        }

        if let Some(ante) = &self.ante_handler {
            let mut ante_ctx = ctx.branch();
            ante_ctx.set_msg_index(MsgIndex::Ante);

            let simulate = ctx.is_simulate();
            let ante_result = panic::catch_unwind(AssertUnwindSafe(|| {
                ante.ante(&mut ante_ctx, tx, simulate)
            }))
            .unwrap_or_else(|payload| Err(panic_to_error(payload)));
            // Gas and mempool hints count even when the ante phase fails.
            ctx.adopt_ante_outputs(&ante_ctx);
            ante_result?;

            if validating {
                self.validate_unit(ctx, MsgIndex::Ante, &ante_ctx)?;
            }

            *ante_events = ante_ctx.event_manager_mut().take();
            ctx.store_mut().write(ante_ctx.into_store())?;
        }

        let mut run_ctx = ctx.branch();
        let mut result = match self.run_msgs(&mut run_ctx, msgs) {
            Ok(result) => result,
            Err((err, events)) => {
                *partial_events = events;
                return Err(err);
            }
        };

        if ctx.is_deliver() {
            ctx.store_mut().write(run_ctx.into_store())?;
        }

        let mut events = ante_events.clone();
        events.append(&mut result.events);
        result.events = events;
        Ok(result)
    }

    /// Resolves the handler for a message: exact type first, then legacy route.
    fn resolve(&self, msg: &dyn Msg, index: usize) -> Result<&MsgHandler> {
        if let Some(handler) = self.msg_router.handler(msg) {
            return Ok(handler);
        }
        match msg.route() {
            Some(route) => self.legacy_router.route(route).ok_or_else(|| {
                Error::UnknownRequest(format!(
                    "unrecognized message route: {route}; message index: {index}"
                ))
            }),
            None => Err(Error::UnknownRequest(format!("can't route message {msg:?}"))),
        }
    }

    /// Executes every message on its own branch of `ctx`.
    ///
    /// Stops at the first failure; sub-branches merged before it stay merged
    /// in `ctx`, which the caller then drops. Check and ReCheck stop before
    /// the first message.
    pub fn run_msgs(
        &self,
        ctx: &mut Context,
        msgs: &[Box<dyn Msg>],
    ) -> std::result::Result<TxResult, (Error, Vec<Event>)> {
        let mut msg_data = Vec::with_capacity(msgs.len());
        let mut logs = Vec::with_capacity(msgs.len());
        let mut events = Vec::new();
        let validating = ctx.is_deliver() && ctx.msg_validator().is_some();

        for (index, msg) in msgs.iter().enumerate() {
            if ctx.is_check_tx() {
                break;
            }

            let handler = self.resolve(msg.as_ref(), index).map_err(|err| (err, Vec::new()))?;
            let mut msg_ctx = ctx.branch();
            msg_ctx.set_msg_index(MsgIndex::Msg(index));

            let result = handler(&mut msg_ctx, msg.as_ref()).map_err(|source| {
                (
                    Error::MessageFailed {
                        index,
                        source: Box::new(source),
                    },
                    Vec::new(),
                )
            })?;

            let mut msg_events =
                vec![Event::new(EVENT_TYPE_MESSAGE).with_attribute(ATTRIBUTE_KEY_ACTION, msg.type_url())];
            msg_events.append(&mut msg_ctx.event_manager_mut().take());
            msg_events.extend(result.events);

            let validation = if validating {
                self.validate_unit(ctx, MsgIndex::Msg(index), &msg_ctx)
            } else {
                Ok(())
            };
            ctx.store_mut()
                .write(msg_ctx.into_store())
                .map_err(|err| (err.into(), Vec::new()))?;

            events.extend(msg_events.iter().cloned());
            msg_data.push(MsgData {
                msg_type: msg.type_url().to_string(),
                data: result.data,
            });
            logs.push(MessageLog {
                msg_index: index,
                log: result.log,
                events: msg_events,
            });

            if let Err(err) = validation {
                return Err((err, events));
            }
        }

        Ok(TxResult {
            data: encode_msg_data(&msg_data),
            log: render_logs(&logs),
            events,
            msg_responses: msg_data,
        })
    }

    /// Checks the accesses recorded on `unit_ctx` against the declarations.
    fn validate_unit(&self, ctx: &Context, unit: MsgIndex, unit_ctx: &Context) -> Result<()> {
        let Some(validator) = ctx.msg_validator() else {
            return Ok(());
        };
        let declared = ctx.access_ops().get(&unit).map(Vec::as_slice).unwrap_or(&[]);
        let missing = validator.validate_access_operations(declared, &unit_ctx.store().get_events());
        if missing.is_empty() {
            return Ok(());
        }

        for op in &missing {
            warn!(
                tx_index = ctx.tx_index(),
                unit = %unit,
                operation = %op,
                "missing access operation"
            );
        }
        let message = match unit {
            MsgIndex::Ante => format!(
                "Invalid Concurrent Execution antehandler missing {} access operations",
                missing.len()
            ),
            MsgIndex::Msg(index) => format!(
                "Invalid Concurrent Execution messageIndex={index}, missing {} access operations",
                missing.len()
            ),
        };
        Err(Error::InvalidConcurrencyExecution(message))
    }

    /// Runs one Deliver transaction and builds its response.
    pub fn deliver_tx(&self, ctx: &mut Context, entry: &TxEntry) -> ResponseDeliverTx {
        ctx.set_tx_index(entry.index);
        ctx.set_tx_checksum(entry.checksum);
        if self.trace {
            let mut trace = TraceContext::new();
            trace.insert("txHash".into(), hex::encode(entry.checksum));
            trace.insert("txIndex".into(), entry.index.to_string());
            ctx.store_mut().set_trace_context(trace);
        }

        let tx = match entry.decoded() {
            Ok(tx) => tx.clone(),
            Err(err) => return ResponseDeliverTx::from_error(&err, GasInfo::default(), Vec::new()),
        };

        let output = self.run_tx(ctx, tx.as_ref());
        match output.result {
            Ok(ref result) => ResponseDeliverTx {
                gas_wanted: output.gas_info.gas_wanted,
                gas_used: output.gas_info.gas_used,
                log: result.log.clone(),
                data: result.data.clone(),
                events: mark_events_to_index(result.events.clone(), &self.index_events),
                evm_tx_info: ctx.evm_tx_info().cloned(),
                ..ResponseDeliverTx::default()
            },
            Err(ref err) => {
                let mut response = ResponseDeliverTx::from_error(
                    err,
                    output.gas_info,
                    mark_events_to_index(output.failure_events(), &self.index_events),
                );
                response.evm_tx_info = ctx.evm_tx_info().cloned();
                response
            }
        }
    }

    /// Invokes the deliver hooks for a committed transaction.
    ///
    /// Must only be called with final results, never from a speculative
    /// execution.
    pub fn run_deliver_hooks(&self, ctx: &Context, entry: &TxEntry, response: &ResponseDeliverTx) {
        if !response.is_ok() || self.deliver_tx_hooks.is_empty() {
            return;
        }
        if let Ok(tx) = entry.decoded() {
            for hook in &self.deliver_tx_hooks {
                hook(ctx, tx.as_ref(), entry.checksum, response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessOperation, MsgValidator, ValidationMode};
    use crate::context::Header;
    use crate::gas::GasMeter;
    use crate::store::{CommitMultiStore, MemCommitStore, StoreKey};
    use crate::tx::MsgResult;
    use assert_matches::assert_matches;
    use std::any::Any;

    #[derive(Debug)]
    struct SetMsg {
        key: &'static [u8],
        route: Option<&'static str>,
        type_url: &'static str,
    }

    impl Msg for SetMsg {
        fn type_url(&self) -> &str {
            self.type_url
        }

        fn route(&self) -> Option<&str> {
            self.route
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct TestTx(Vec<Box<dyn Msg>>);

    impl Tx for TestTx {
        fn msgs(&self) -> &[Box<dyn Msg>] {
            &self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn set(key: &'static [u8]) -> Box<dyn Msg> {
        Box::new(SetMsg {
            key,
            route: None,
            type_url: "/test.Set",
        })
    }

    fn bank() -> StoreKey {
        StoreKey::new("bank")
    }

    fn set_handler() -> MsgHandler {
        Arc::new(|ctx: &mut Context, msg: &dyn Msg| -> Result<MsgResult> {
            let msg = msg.as_any().downcast_ref::<SetMsg>().expect("SetMsg");
            ctx.set(&bank(), msg.key, b"1".to_vec())?;
            ctx.emit_event(Event::new("set").with_attribute("key", String::from_utf8_lossy(msg.key)));
            Ok(MsgResult {
                data: msg.key.to_vec(),
                log: "ok".into(),
                events: Vec::new(),
            })
        })
    }

    fn runner() -> TxRunner {
        let mut runner = TxRunner::default();
        runner.msg_router.register("/test.Set", set_handler());
        runner.ante_handler = Some(Arc::new(|ctx: &mut Context, _: &dyn Tx, _: bool| -> Result<()> {
            ctx.set_gas_meter(GasMeter::new(100_000));
            ctx.set(&bank(), b"ante", b"x".to_vec())?;
            ctx.emit_event(Event::new("ante"));
            Ok(())
        }));
        runner
    }

    fn deliver_ctx(cms: &MemCommitStore) -> Context {
        Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Deliver)
    }

    #[test]
    fn test_events_ante_then_messages() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let tx = TestTx(vec![set(b"a"), set(b"b")]);

        let output = runner().run_tx(&mut ctx, &tx);
        let result = output.result.unwrap();
        let kinds: Vec<&str> = result.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ante", "message", "set", "message", "set"]);
        assert_eq!(result.msg_responses.len(), 2);
        assert_eq!(ctx.store().get(&bank(), b"b").unwrap(), Some(b"1".to_vec()));
        assert_eq!(output.gas_info.gas_wanted, 100_000);
        assert!(output.gas_info.gas_used > 0);
    }

    #[test]
    fn test_failed_message_rolls_back_all_messages() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let tx = TestTx(vec![
            set(b"a"),
            Box::new(SetMsg {
                key: b"b",
                route: Some("missing"),
                type_url: "/test.Unknown",
            }),
        ]);

        let output = runner().run_tx(&mut ctx, &tx);
        assert_matches!(
            output.result,
            Err(Error::UnknownRequest(msg)) if msg == "unrecognized message route: missing; message index: 1"
        );
        // Ante effects persist, message effects do not.
        assert_eq!(ctx.store().get(&bank(), b"ante").unwrap(), Some(b"x".to_vec()));
        assert_eq!(ctx.store().get(&bank(), b"a").unwrap(), None);
        assert_eq!(output.ante_events.len(), 1);
    }

    #[test]
    fn test_legacy_route_fallback() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let mut runner = runner();
        runner.legacy_router.add_route("legacy", set_handler());
        let tx = TestTx(vec![Box::new(SetMsg {
            key: b"l",
            route: Some("legacy"),
            type_url: "/test.Legacy",
        })]);

        runner.run_tx(&mut ctx, &tx).result.unwrap();
        assert_eq!(ctx.store().get(&bank(), b"l").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_unroutable_message() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let tx = TestTx(vec![Box::new(SetMsg {
            key: b"x",
            route: None,
            type_url: "/test.Nothing",
        })]);
        assert_matches!(
            runner().run_tx(&mut ctx, &tx).result,
            Err(Error::UnknownRequest(msg)) if msg.starts_with("can't route message")
        );
    }

    #[test]
    fn test_check_mode_skips_messages() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Check);
        let output = runner().run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        output.result.unwrap();
        // Non-Deliver modes reset the access log.
        assert!(ctx.store().get_events().is_empty());
        assert_eq!(ctx.store().get(&bank(), b"a").unwrap(), None);
        assert_eq!(ctx.store().get(&bank(), b"ante").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_empty_tx_rejected() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        assert_matches!(
            runner().run_tx(&mut ctx, &TestTx(Vec::new())).result,
            Err(Error::InvalidRequest(_))
        );
    }

    #[test]
    fn test_ante_failure_reports_ante_gas_only() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let mut runner = runner();
        runner.ante_handler = Some(Arc::new(|ctx: &mut Context, _: &dyn Tx, _: bool| -> Result<()> {
            ctx.set_gas_meter(GasMeter::new(50_000));
            ctx.set(&bank(), b"fee", b"paid".to_vec())?;
            Err(Error::Unauthorized("bad signature".into()))
        }));

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        assert_matches!(output.result, Err(Error::Unauthorized(_)));
        assert_eq!(output.gas_info.gas_wanted, 50_000);
        assert_eq!(output.gas_info.gas_used, 2000 + 30 * 7);
        assert_eq!(ctx.store().get(&bank(), b"fee").unwrap(), None);
    }

    #[test]
    fn test_handler_panic_is_recovered() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let mut runner = runner();
        runner.msg_router = MsgServiceRouter::new();
        runner
            .msg_router
            .register("/test.Set", Arc::new(|_: &mut Context, _: &dyn Msg| -> Result<MsgResult> { panic!("handler exploded") }));

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        assert_eq!(output.result, Err(Error::Panic("handler exploded".into())));
        assert!(output.gas_info.gas_used > 0);
    }

    #[test]
    fn test_out_of_gas_in_handler() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        let mut runner = runner();
        runner.ante_handler = Some(Arc::new(|ctx: &mut Context, _: &dyn Tx, _: bool| -> Result<()> {
            ctx.set_gas_meter(GasMeter::new(2000));
            Ok(())
        }));

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        assert_matches!(
            output.result,
            Err(Error::OutOfGas { gas_wanted: 2000, .. })
        );
    }

    #[test]
    fn test_undeclared_write_fails_validation_with_partial_events() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        ctx.set_msg_validator(Some(MsgValidator::new(ValidationMode::Permissive)));

        let mut runner = runner();
        runner.access_control.set_ante_generator(Arc::new(|_: &dyn Tx| {
            vec![AccessOperation::write(&bank(), b"ante")]
        }));
        runner.access_control.register(
            "/test.Set",
            Arc::new(|msg: &dyn Msg| {
                let msg = msg.as_any().downcast_ref::<SetMsg>().expect("SetMsg");
                // Declares the wrong key for "b".
                let key: &[u8] = if msg.key == b"b" { b"zzz" } else { msg.key };
                vec![AccessOperation::write(&bank(), key)]
            }),
        );

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a"), set(b"b")]));
        assert_eq!(
            output.result,
            Err(Error::InvalidConcurrencyExecution(
                "Invalid Concurrent Execution messageIndex=1, missing 1 access operations".into()
            ))
        );
        assert_eq!(output.partial_events.len(), 4);
        assert_eq!(ctx.store().get(&bank(), b"a").unwrap(), None);
    }

    #[test]
    fn test_writes_through_nested_branch_are_validated() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        ctx.set_msg_validator(Some(MsgValidator::new(ValidationMode::Permissive)));

        let mut runner = runner();
        runner.msg_router.register(
            "/test.Nested",
            Arc::new(|ctx: &mut Context, _: &dyn Msg| -> Result<MsgResult> {
                ctx.set(&bank(), b"declared", b"1".to_vec())?;
                let mut child = ctx.branch();
                child.set(&bank(), b"undeclared", b"x".to_vec())?;
                ctx.store_mut().write(child.into_store())?;
                Ok(MsgResult::default())
            }),
        );
        runner.access_control.set_ante_generator(Arc::new(|_: &dyn Tx| {
            vec![AccessOperation::write(&bank(), b"ante")]
        }));
        runner.access_control.register(
            "/test.Nested",
            Arc::new(|_: &dyn Msg| vec![AccessOperation::write(&bank(), b"declared")]),
        );

        let tx = TestTx(vec![Box::new(SetMsg {
            key: b"declared",
            route: None,
            type_url: "/test.Nested",
        })]);
        let output = runner.run_tx(&mut ctx, &tx);
        assert_eq!(
            output.result,
            Err(Error::InvalidConcurrencyExecution(
                "Invalid Concurrent Execution messageIndex=0, missing 1 access operations".into()
            ))
        );
        assert_eq!(ctx.store().get(&bank(), b"undeclared").unwrap(), None);
        assert_eq!(ctx.store().get(&bank(), b"declared").unwrap(), None);
    }

    #[test]
    fn test_ante_writes_through_nested_branch_are_validated() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        ctx.set_msg_validator(Some(MsgValidator::new(ValidationMode::Permissive)));

        let mut runner = runner();
        runner.ante_handler = Some(Arc::new(|ctx: &mut Context, _: &dyn Tx, _: bool| -> Result<()> {
            ctx.set_gas_meter(GasMeter::new(100_000));
            let mut child = ctx.branch();
            child.set(&bank(), b"fee", b"paid".to_vec())?;
            ctx.store_mut().write(child.into_store())?;
            Ok(())
        }));
        runner.access_control.set_ante_generator(Arc::new(|_: &dyn Tx| {
            vec![AccessOperation::write(&bank(), b"ante")]
        }));
        runner
            .access_control
            .register("/test.Set", Arc::new(|_: &dyn Msg| vec![AccessOperation::write(&bank(), b"a")]));

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        assert_eq!(
            output.result,
            Err(Error::InvalidConcurrencyExecution(
                "Invalid Concurrent Execution antehandler missing 1 access operations".into()
            ))
        );
        assert_eq!(ctx.store().get(&bank(), b"fee").unwrap(), None);
    }

    #[test]
    fn test_ante_validation_failure() {
        let cms = MemCommitStore::with_stores(["bank"]);
        let mut ctx = deliver_ctx(&cms);
        ctx.set_msg_validator(Some(MsgValidator::default()));
        let mut runner = runner();
        runner
            .access_control
            .set_ante_generator(Arc::new(|_: &dyn Tx| vec![AccessOperation::read(&bank(), b"")]));

        let output = runner.run_tx(&mut ctx, &TestTx(vec![set(b"a")]));
        assert_eq!(
            output.result,
            Err(Error::InvalidConcurrencyExecution(
                "Invalid Concurrent Execution antehandler missing 1 access operations".into()
            ))
        );
    }
}
