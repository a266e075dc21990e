//! Deterministic demo workload: a bank module with signed transfers.
//!
//! Accounts carry secp256k1 keys; transactions are signed up front so that
//! benchmarks and tests measure execution rather than signing. The wire
//! format is a compact big-endian encoding:
//!
//! ```text
//! version u8 | chain_id u64 | from [20] | nonce u64 | fee u64 | gas_limit u64
//! | msg_count u8 | (to [20] | amount u64) * msg_count | r [32] | s [32] | v u8
//! ```
//!
//! The signature covers the keccak hash of everything before it.

pub mod bank;

pub use bank::{BankTx, MsgSend};

use crate::error::{Error, Result};
use alloy_primitives::{keccak256, Address, Signature, B256, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const WIRE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8 + 20 + 8 + 8 + 8 + 1;
const MSG_LEN: usize = 20 + 8;
const SIGNATURE_LEN: usize = 65;

/// Fee attached to every generated transaction.
pub const DEFAULT_FEE: u64 = 100;
/// Gas limit attached to every generated transaction.
pub const DEFAULT_GAS_LIMIT: u64 = 200_000;
/// Genesis balance of every generated account.
pub const INITIAL_BALANCE: u64 = 1_000_000_000;

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self { signing_key, address }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        // Out-of-range scalars are vanishingly rare; draw again.
        let signing_key = loop {
            rng.fill(&mut key_bytes);
            if let Ok(key) = SigningKey::from_bytes(&key_bytes.into()) {
                break key;
            }
        };
        Self::from_signing_key(signing_key)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Wire format
// ============================================================================

/// One transfer inside a [`Transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payment {
    pub to: Address,
    pub amount: u64,
}

/// Unsigned transaction body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub chain_id: u64,
    pub from: Address,
    pub nonce: u64,
    pub fee: u64,
    pub gas_limit: u64,
    pub payments: Vec<Payment>,
}

impl Transfer {
    fn encode_body(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.payments.len())
            .map_err(|_| Error::InvalidRequest(format!("too many messages: {}", self.payments.len())))?;
        let mut out = Vec::with_capacity(HEADER_LEN + MSG_LEN * self.payments.len() + SIGNATURE_LEN);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(self.from.as_slice());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.fee.to_be_bytes());
        out.extend_from_slice(&self.gas_limit.to_be_bytes());
        out.push(count);
        for payment in &self.payments {
            out.extend_from_slice(payment.to.as_slice());
            out.extend_from_slice(&payment.amount.to_be_bytes());
        }
        Ok(out)
    }

    /// Signs the body with `key` and returns the encoded transaction.
    pub fn sign(&self, key: &SigningKey) -> Result<Vec<u8>> {
        let mut out = self.encode_body()?;
        let hash = keccak256(&out);
        let (sig, recovery_id) = key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|err| Error::InvalidRequest(format!("signing failed: {err}")))?;
        let signature = Signature::from_signature_and_parity(sig, recovery_id.is_y_odd());

        out.extend_from_slice(&signature.r().to_be_bytes::<32>());
        out.extend_from_slice(&signature.s().to_be_bytes::<32>());
        out.push(u8::from(signature.v()));
        Ok(out)
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

/// Parses a signed transfer.
pub fn decode_transfer(bytes: &[u8]) -> Result<(Transfer, Signature, B256)> {
    if bytes.len() < HEADER_LEN + SIGNATURE_LEN {
        return Err(Error::TxDecode(format!("transaction too short: {} bytes", bytes.len())));
    }
    if bytes[0] != WIRE_VERSION {
        return Err(Error::TxDecode(format!("unsupported version {}", bytes[0])));
    }
    let count = bytes[HEADER_LEN - 1] as usize;
    let body_len = HEADER_LEN + MSG_LEN * count;
    if bytes.len() != body_len + SIGNATURE_LEN {
        return Err(Error::TxDecode(format!(
            "expected {} bytes for {count} messages, got {}",
            body_len + SIGNATURE_LEN,
            bytes.len()
        )));
    }

    let payments = (0..count)
        .map(|i| {
            let at = HEADER_LEN + i * MSG_LEN;
            Payment {
                to: Address::from_slice(&bytes[at..at + 20]),
                amount: read_u64(bytes, at + 20),
            }
        })
        .collect();
    let transfer = Transfer {
        chain_id: read_u64(bytes, 1),
        from: Address::from_slice(&bytes[9..29]),
        nonce: read_u64(bytes, 29),
        fee: read_u64(bytes, 37),
        gas_limit: read_u64(bytes, 45),
        payments,
    };

    let sig = &bytes[body_len..];
    let signature = Signature::new(
        U256::from_be_slice(&sig[..32]),
        U256::from_be_slice(&sig[32..64]),
        sig[64] != 0,
    );
    Ok((transfer, signature, keccak256(&bytes[..body_len])))
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub num_transactions: usize,
    /// 0.0 = transfers spread over every account, 1.0 = all of them hit two
    /// hot accounts.
    pub conflict_factor: f64,
    pub seed: u64,
    /// Chain id covered by signatures.
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

/// Genesis document consumed by the bank init chainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    pub balances: Vec<GenesisBalance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisBalance {
    /// Hex address, `0x` prefixed.
    pub address: String,
    pub amount: u64,
}

/// Pre-generated accounts and signed transactions.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub transactions: Vec<Vec<u8>>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates and signs every transaction up front.
    pub fn generate(config: WorkloadConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();
        if accounts.len() < 2 {
            return Err(Error::InvalidRequest("workload needs at least two accounts".into()));
        }

        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // Hot range shrinks towards two accounts as the conflict factor grows.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0)).max(2.0) as usize
        } else {
            config.num_accounts
        };

        let mut transactions = Vec::with_capacity(config.num_transactions);
        for _ in 0..config.num_transactions {
            let range = if rng.gen::<f64>() < config.conflict_factor {
                hot_account_count
            } else {
                config.num_accounts
            };
            let from = rng.gen_range(0..range);
            let mut to = rng.gen_range(0..range);
            while to == from {
                to = rng.gen_range(0..range);
            }

            let nonce = nonces.entry(from).or_insert(0);
            let transfer = Transfer {
                chain_id: config.chain_id,
                from: accounts[from].address,
                nonce: *nonce,
                fee: DEFAULT_FEE,
                gas_limit: DEFAULT_GAS_LIMIT,
                payments: vec![Payment {
                    to: accounts[to].address,
                    amount: rng.gen_range(1..1_000),
                }],
            };
            *nonce += 1;
            transactions.push(transfer.sign(&accounts[from].signing_key)?);
        }

        Ok(Self {
            accounts,
            transactions,
            config,
        })
    }

    /// Every account funded with [`INITIAL_BALANCE`].
    pub fn genesis(&self) -> GenesisState {
        GenesisState {
            balances: self
                .accounts
                .iter()
                .map(|account| GenesisBalance {
                    address: account.address.to_string(),
                    amount: INITIAL_BALANCE,
                })
                .collect(),
        }
    }

    /// Transactions split into blocks of at most `block_size`.
    pub fn blocks(&self, block_size: usize) -> impl Iterator<Item = &[Vec<u8>]> {
        self.transactions.chunks(block_size.max(1))
    }
}
