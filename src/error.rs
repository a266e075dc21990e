//! Error taxonomy of the application.
//!
//! Every error maps to an ABCI `(codespace, code)` pair through
//! [`Error::abci_info`]. Codes in the root codespace follow the numbering the
//! chain clients already know.

use crate::store::StoreError;

/// Codespace of the errors defined here.
pub const ROOT_CODESPACE: &str = "sdk";

/// Code reported by successful transactions and queries.
pub const CODE_OK: u32 = 0;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("tx parse error: {0}")]
    TxDecode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown request: {0}")]
    UnknownRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("insufficient fee: {0}")]
    InsufficientFee(String),
    #[error("incorrect account sequence: {0}")]
    WrongSequence(String),
    #[error("failed to execute message; message index: {index}: {source}")]
    MessageFailed {
        index: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid concurrent execution: {0}")]
    InvalidConcurrencyExecution(String),
    /// Gas limit exceeded; produced by the recovery chain from [`Error::GasExhausted`].
    #[error("out of gas in location: {descriptor}; gasWanted: {gas_wanted}, gasUsed: {gas_used}")]
    OutOfGas {
        descriptor: String,
        gas_wanted: u64,
        gas_used: u64,
    },
    /// Raw signal from the gas meter.
    #[error("out of gas in location: {descriptor}")]
    GasExhausted { descriptor: String },
    /// Speculative execution read an estimate of transaction `dependency`.
    #[error("occ abort: waiting on transaction {dependency}")]
    OccAbort { dependency: usize },
    #[error("panic: {0}")]
    Panic(String),
    #[error("invalid height: {0}")]
    InvalidHeight(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("{log}")]
    Custom {
        codespace: String,
        code: u32,
        log: String,
    },
}

impl Error {
    /// ABCI codespace and code of this error.
    pub fn abci_info(&self) -> (&str, u32) {
        let code = match self {
            Error::TxDecode(_) => 2,
            Error::WrongSequence(_) => 3,
            Error::Unauthorized(_) => 4,
            Error::InsufficientFunds(_) => 5,
            Error::UnknownRequest(_) => 6,
            Error::OutOfGas { .. } | Error::GasExhausted { .. } => 11,
            Error::InsufficientFee(_) => 13,
            Error::InvalidRequest(_) => 18,
            Error::InvalidHeight(_) => 26,
            Error::InvalidConcurrencyExecution(_) => 39,
            Error::OccAbort { .. } => 40,
            Error::Store(_) => 41,
            Error::Snapshot(_) => 42,
            Error::Panic(_) => 111222,
            Error::MessageFailed { source, .. } => return source.abci_info(),
            Error::Custom {
                codespace, code, ..
            } => return (codespace.as_str(), *code),
        };
        (ROOT_CODESPACE, code)
    }

    /// Transaction the failing execution has to wait for, if this error (or
    /// the error it wraps) is a speculative abort.
    pub fn occ_dependency(&self) -> Option<usize> {
        match self {
            Error::OccAbort { dependency } => Some(*dependency),
            Error::MessageFailed { source, .. } => source.occ_dependency(),
            _ => None,
        }
    }

    pub fn is_out_of_gas(&self) -> bool {
        match self {
            Error::OutOfGas { .. } | Error::GasExhausted { .. } => true,
            Error::MessageFailed { source, .. } => source.is_out_of_gas(),
            _ => false,
        }
    }

    pub fn custom(codespace: impl Into<String>, code: u32, log: impl Into<String>) -> Self {
        Error::Custom {
            codespace: codespace.into(),
            code,
            log: log.into(),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Dependency(dependency) => Error::OccAbort { dependency },
            other => Error::Store(other.to_string()),
        }
    }
}
