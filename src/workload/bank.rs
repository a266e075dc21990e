//! Bank module: balances, account sequences and the transfer message.

use super::{decode_transfer, GenesisState, Transfer};
use crate::acl::AccessOperation;
use crate::app::params::KvParamStore;
use crate::app::types::{RequestInitChain, RequestQuery, ResponseInitChain};
use crate::app::BaseAppBuilder;
use crate::config::AppConfig;
use crate::context::{Context, EvmTxInfo, ExecMode, PendingTxStatus};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::gas::GasMeter;
use crate::router::AnteHandler;
use crate::store::{MemCommitStore, StoreKey};
use crate::tx::{Msg, MsgResult, Tx, TxDecoder};
use alloy_primitives::{Address, Signature, B256};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

pub const BANK_STORE: &str = "bank";
pub const AUTH_STORE: &str = "auth";
pub const PARAMS_STORE: &str = "params";

pub const MSG_SEND_TYPE_URL: &str = "/bank.MsgSend";
pub const ROUTE: &str = "bank";

const BALANCE_PREFIX: &[u8] = b"balance/";
const NONCE_PREFIX: &[u8] = b"nonce/";

fn bank_store() -> StoreKey {
    StoreKey::new(BANK_STORE)
}

fn auth_store() -> StoreKey {
    StoreKey::new(AUTH_STORE)
}

pub fn balance_key(address: &Address) -> Vec<u8> {
    [BALANCE_PREFIX, address.as_slice()].concat()
}

pub fn nonce_key(address: &Address) -> Vec<u8> {
    [NONCE_PREFIX, address.as_slice()].concat()
}

fn decode_u128(raw: &[u8]) -> Result<u128> {
    let bytes: [u8; 16] = raw
        .try_into()
        .map_err(|_| Error::Store(format!("malformed balance of {} bytes", raw.len())))?;
    Ok(u128::from_be_bytes(bytes))
}

fn decode_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Store(format!("malformed sequence of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn balance(ctx: &Context, address: &Address) -> Result<u128> {
    match ctx.get(&bank_store(), &balance_key(address))? {
        Some(raw) => decode_u128(&raw),
        None => Ok(0),
    }
}

pub fn set_balance(ctx: &mut Context, address: &Address, amount: u128) -> Result<()> {
    ctx.set(&bank_store(), &balance_key(address), amount.to_be_bytes().to_vec())
}

pub fn sequence(ctx: &Context, address: &Address) -> Result<u64> {
    match ctx.get(&auth_store(), &nonce_key(address))? {
        Some(raw) => decode_u64(&raw),
        None => Ok(0),
    }
}

fn set_sequence(ctx: &mut Context, address: &Address, sequence: u64) -> Result<()> {
    ctx.set(&auth_store(), &nonce_key(address), sequence.to_be_bytes().to_vec())
}

// ============================================================================
// Messages and transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSend {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
}

impl Msg for MsgSend {
    fn type_url(&self) -> &str {
        MSG_SEND_TYPE_URL
    }

    fn validate_basic(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::InvalidRequest("transfer amount must be positive".into()));
        }
        if self.from == self.to {
            return Err(Error::InvalidRequest("sender and recipient are the same".into()));
        }
        Ok(())
    }

    fn route(&self) -> Option<&str> {
        Some(ROUTE)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Decoded bank transaction.
#[derive(Debug)]
pub struct BankTx {
    pub chain_id: u64,
    pub from: Address,
    pub nonce: u64,
    pub fee: u64,
    pub gas_limit: u64,
    pub signature: Signature,
    /// Keccak hash of the signed body.
    pub sign_hash: B256,
    msgs: Vec<Box<dyn Msg>>,
}

impl BankTx {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (transfer, signature, sign_hash) = decode_transfer(bytes)?;
        let Transfer {
            chain_id,
            from,
            nonce,
            fee,
            gas_limit,
            payments,
        } = transfer;
        let msgs = payments
            .into_iter()
            .map(|payment| {
                Box::new(MsgSend {
                    from,
                    to: payment.to,
                    amount: payment.amount,
                }) as Box<dyn Msg>
            })
            .collect();
        Ok(Self {
            chain_id,
            from,
            nonce,
            fee,
            gas_limit,
            signature,
            sign_hash,
            msgs,
        })
    }
}

impl Tx for BankTx {
    fn msgs(&self) -> &[Box<dyn Msg>] {
        &self.msgs
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn tx_decoder() -> TxDecoder {
    Arc::new(|bytes: &[u8]| -> Result<Arc<dyn Tx>> { Ok(Arc::new(BankTx::decode(bytes)?)) })
}

fn downcast_tx(tx: &dyn Tx) -> Result<&BankTx> {
    tx.as_any()
        .downcast_ref::<BankTx>()
        .ok_or_else(|| Error::TxDecode(format!("expected a bank transaction, got {tx:?}")))
}

// ============================================================================
// Ante handler
// ============================================================================

/// Gas meter, chain id, signature, sequence and fee checks.
///
/// The fee is burned from the sender's balance and doubles as the mempool
/// priority. In CheckTx a nonce ahead of the account sequence is accepted as
/// pending instead of rejected.
#[derive(Debug, Clone)]
pub struct BankAnteHandler {
    pub chain_id: u64,
    pub min_fee: u64,
    pub verify_signatures: bool,
}

impl BankAnteHandler {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            min_fee: 1,
            verify_signatures: true,
        }
    }
}

impl AnteHandler for BankAnteHandler {
    fn ante(&self, ctx: &mut Context, tx: &dyn Tx, simulate: bool) -> Result<()> {
        let tx = downcast_tx(tx)?;
        ctx.set_gas_meter(if simulate {
            GasMeter::infinite()
        } else {
            GasMeter::new(tx.gas_limit)
        });

        if tx.chain_id != self.chain_id {
            return Err(Error::Unauthorized(format!(
                "wrong chain id: expected {}, got {}",
                self.chain_id, tx.chain_id
            )));
        }
        if tx.msgs.iter().any(|msg| {
            msg.as_any()
                .downcast_ref::<MsgSend>()
                .map_or(true, |send| send.from != tx.from)
        }) {
            return Err(Error::Unauthorized("message signer does not match transaction signer".into()));
        }
        if !simulate && tx.fee < self.min_fee {
            return Err(Error::InsufficientFee(format!(
                "got {}, required {}",
                tx.fee, self.min_fee
            )));
        }
        if self.verify_signatures && !simulate {
            let signer = tx
                .signature
                .recover_address_from_prehash(&tx.sign_hash)
                .map_err(|err| Error::Unauthorized(format!("signature verification failed: {err}")))?;
            if signer != tx.from {
                return Err(Error::Unauthorized(format!(
                    "signature verification failed: recovered {signer}, expected {}",
                    tx.from
                )));
            }
        }

        let expected = sequence(ctx, &tx.from)?;
        if ctx.mode() == ExecMode::Check && tx.nonce > expected {
            debug!(from = %tx.from, nonce = tx.nonce, expected, "pending transaction");
            ctx.set_pending_tx_checker(Arc::new(|| PendingTxStatus::Pending));
            ctx.set_expire_tx_handler(Arc::new(|| {}));
            ctx.set_priority(tx.fee as i64);
            return Ok(());
        }
        if tx.nonce != expected {
            return Err(Error::WrongSequence(format!(
                "account sequence mismatch, expected {expected}, got {}",
                tx.nonce
            )));
        }
        set_sequence(ctx, &tx.from, expected + 1)?;

        let funds = balance(ctx, &tx.from)?;
        let fee = u128::from(tx.fee);
        if funds < fee {
            return Err(Error::InsufficientFunds(format!("{funds} < {fee} fee")));
        }
        set_balance(ctx, &tx.from, funds - fee)?;

        ctx.set_priority(tx.fee as i64);
        ctx.set_evm_tx_info(EvmTxInfo {
            sender: tx.from,
            nonce: tx.nonce,
            tx_hash: tx.sign_hash,
            vm_error: String::new(),
        });
        ctx.emit_event(
            Event::new("tx")
                .with_attribute("fee", tx.fee.to_string())
                .with_attribute("acc_seq", format!("{}/{}", tx.from, tx.nonce)),
        );
        Ok(())
    }
}

// ============================================================================
// Message handler
// ============================================================================

pub fn send(ctx: &mut Context, msg: &dyn Msg) -> Result<MsgResult> {
    let Some(msg) = msg.as_any().downcast_ref::<MsgSend>() else {
        return Err(Error::UnknownRequest(format!("unrecognized bank message {msg:?}")));
    };
    let amount = u128::from(msg.amount);

    let from_balance = balance(ctx, &msg.from)?;
    if from_balance < amount {
        return Err(Error::InsufficientFunds(format!("{from_balance} < {amount}")));
    }
    set_balance(ctx, &msg.from, from_balance - amount)?;
    let to_balance = balance(ctx, &msg.to)?;
    set_balance(ctx, &msg.to, to_balance + amount)?;

    ctx.emit_event(
        Event::new("transfer")
            .with_attribute("sender", msg.from.to_string())
            .with_attribute("recipient", msg.to.to_string())
            .with_attribute("amount", msg.amount.to_string()),
    );
    Ok(MsgResult::default())
}

// ============================================================================
// Access declarations
// ============================================================================

pub fn ante_dependencies(tx: &dyn Tx) -> Vec<AccessOperation> {
    let Ok(tx) = downcast_tx(tx) else {
        return vec![AccessOperation::unknown(), AccessOperation::commit()];
    };
    let (auth, bank) = (auth_store(), bank_store());
    vec![
        AccessOperation::read(&auth, &nonce_key(&tx.from)),
        AccessOperation::write(&auth, &nonce_key(&tx.from)),
        AccessOperation::read(&bank, &balance_key(&tx.from)),
        AccessOperation::write(&bank, &balance_key(&tx.from)),
        AccessOperation::commit(),
    ]
}

pub fn send_dependencies(msg: &dyn Msg) -> Vec<AccessOperation> {
    let Some(msg) = msg.as_any().downcast_ref::<MsgSend>() else {
        return vec![AccessOperation::unknown(), AccessOperation::commit()];
    };
    let bank = bank_store();
    let mut ops = Vec::with_capacity(5);
    for address in [&msg.from, &msg.to] {
        ops.push(AccessOperation::read(&bank, &balance_key(address)));
        ops.push(AccessOperation::write(&bank, &balance_key(address)));
    }
    ops.push(AccessOperation::commit());
    ops
}

// ============================================================================
// Genesis and queries
// ============================================================================

/// Funds the genesis accounts. Stores the consensus params handed in.
pub fn init_genesis(ctx: &mut Context, req: &RequestInitChain) -> Result<ResponseInitChain> {
    let genesis: GenesisState = if req.app_state_bytes.is_empty() {
        GenesisState::default()
    } else {
        serde_json::from_slice(&req.app_state_bytes)
            .map_err(|err| Error::InvalidRequest(format!("invalid genesis state: {err}")))?
    };
    for entry in &genesis.balances {
        let address: Address = entry
            .address
            .parse()
            .map_err(|err| Error::InvalidRequest(format!("invalid genesis address {}: {err}", entry.address)))?;
        let current = balance(ctx, &address)?;
        set_balance(ctx, &address, current + u128::from(entry.amount))?;
    }
    debug!(accounts = genesis.balances.len(), "bank genesis");
    Ok(ResponseInitChain {
        consensus_params: req.consensus_params.clone(),
        app_hash: Vec::new(),
    })
}

/// `/custom/bank/balance/<address>` and `/custom/bank/sequence/<address>`,
/// answered as decimal strings.
pub fn query(ctx: &Context, path: &[&str], _req: &RequestQuery) -> Result<Vec<u8>> {
    let (what, address) = match path {
        [what, address] => (*what, *address),
        _ => return Err(Error::UnknownRequest(format!("unknown bank query {}", path.join("/")))),
    };
    let address: Address = address
        .parse()
        .map_err(|err| Error::InvalidRequest(format!("invalid address {address}: {err}")))?;
    let value = match what {
        "balance" => balance(ctx, &address)?.to_string(),
        "sequence" => sequence(ctx, &address)?.to_string(),
        _ => return Err(Error::UnknownRequest(format!("unknown bank query {what}"))),
    };
    Ok(value.into_bytes())
}

/// An application builder with the bank module wired in.
pub fn app_builder(name: &str, config: AppConfig, chain_id: u64) -> BaseAppBuilder {
    let mut builder = BaseAppBuilder::new(name, MemCommitStore::new(), tx_decoder());
    builder
        .config(config)
        .mount_store(BANK_STORE)
        .mount_store(AUTH_STORE)
        .mount_store(PARAMS_STORE)
        .ante_handler(Arc::new(BankAnteHandler::new(chain_id)))
        .msg_handler(MSG_SEND_TYPE_URL, Arc::new(send))
        .legacy_route(ROUTE, Arc::new(send))
        .dependency_generator(MSG_SEND_TYPE_URL, Arc::new(send_dependencies))
        .ante_dependency_generator(Arc::new(ante_dependencies))
        .query_route(ROUTE, Arc::new(query))
        .init_chainer(Arc::new(init_genesis))
        .param_store(Arc::new(KvParamStore::new(StoreKey::new(PARAMS_STORE))));
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Header;
    use crate::store::CommitMultiStore;
    use crate::workload::{Account, Payment};
    use assert_matches::assert_matches;

    fn ctx() -> Context {
        let cms = MemCommitStore::with_stores([BANK_STORE, AUTH_STORE]);
        Context::new(cms.cache_multi_store(), Header::default(), ExecMode::Deliver)
    }

    fn signed(account: &Account, nonce: u64, fee: u64) -> BankTx {
        let bytes = Transfer {
            chain_id: 1,
            from: account.address,
            nonce,
            fee,
            gas_limit: 100_000,
            payments: vec![Payment {
                to: Address::repeat_byte(7),
                amount: 10,
            }],
        }
        .sign(&account.signing_key)
        .unwrap();
        BankTx::decode(&bytes).unwrap()
    }

    #[test]
    fn test_ante_charges_fee_and_bumps_sequence() {
        let mut ctx = ctx();
        let account = Account::from_seed(1);
        set_balance(&mut ctx, &account.address, 1_000).unwrap();

        let ante = BankAnteHandler::new(1);
        ante.ante(&mut ctx, &signed(&account, 0, 25), false).unwrap();
        assert_eq!(balance(&ctx, &account.address).unwrap(), 975);
        assert_eq!(sequence(&ctx, &account.address).unwrap(), 1);
        assert_eq!(ctx.priority(), 25);
        assert_eq!(ctx.evm_tx_info().map(|info| info.nonce), Some(0));

        assert_matches!(
            ante.ante(&mut ctx, &signed(&account, 0, 25), false),
            Err(Error::WrongSequence(_))
        );
    }

    #[test]
    fn test_ante_rejects_foreign_signature() {
        let mut ctx = ctx();
        let account = Account::from_seed(1);
        let mut tx = signed(&account, 0, 25);
        tx.from = Account::from_seed(2).address;
        assert_matches!(
            BankAnteHandler::new(1).ante(&mut ctx, &tx, false),
            Err(Error::Unauthorized(_))
        );
    }

    #[test]
    fn test_ante_pending_nonce_in_check_mode() {
        let mut ctx = ctx();
        ctx.set_mode(ExecMode::Check);
        let account = Account::from_seed(1);
        BankAnteHandler::new(1)
            .ante(&mut ctx, &signed(&account, 3, 25), false)
            .unwrap();
        assert!(ctx.pending_tx_checker().is_some());
        assert_eq!(sequence(&ctx, &account.address).unwrap(), 0);
    }

    #[test]
    fn test_send_moves_funds() {
        let mut ctx = ctx();
        let (from, to) = (Address::repeat_byte(1), Address::repeat_byte(2));
        set_balance(&mut ctx, &from, 100).unwrap();

        let msg = MsgSend { from, to, amount: 40 };
        send(&mut ctx, &msg).unwrap();
        assert_eq!(balance(&ctx, &from).unwrap(), 60);
        assert_eq!(balance(&ctx, &to).unwrap(), 40);
        assert_eq!(ctx.event_manager().events()[0].attribute("amount"), Some("40"));

        let msg = MsgSend { from, to, amount: 61 };
        assert_matches!(send(&mut ctx, &msg), Err(Error::InsufficientFunds(_)));
    }

    #[test]
    fn test_send_dependencies_cover_both_balances() {
        let msg = MsgSend {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            amount: 1,
        };
        let ops = send_dependencies(&msg);
        assert_eq!(ops.len(), 5);
        assert_eq!(ops.last(), Some(&AccessOperation::commit()));
    }
}
