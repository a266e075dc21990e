//! Turning panics and raw failure signals into structured errors.
//!
//! The pipeline catches a panic once, converts the payload with
//! [`panic_to_error`], and passes every error it is about to return through a
//! [`RecoveryChain`]: custom handlers first (newest first), then the built-in
//! OCC-abort, out-of-gas and default handlers.

use crate::error::Error;
use crate::tx::GasInfo;
use std::any::Any;
use std::sync::Arc;

/// Returns `Some` to replace the error, `None` to pass it on.
pub type RecoveryHandler = Arc<dyn Fn(&Error) -> Option<Error> + Send + Sync>;

/// Panic payload a handler may raise to signal gas exhaustion.
#[derive(Debug, Clone)]
pub struct OutOfGasPanic {
    pub descriptor: String,
}

/// Panic payload a handler may raise to abort a speculative execution.
#[derive(Debug, Clone, Copy)]
pub struct OccAbortPanic {
    pub dependency: usize,
}

/// Maps a caught panic payload onto the error taxonomy.
pub fn panic_to_error(payload: Box<dyn Any + Send>) -> Error {
    let payload = match payload.downcast::<OutOfGasPanic>() {
        Ok(oog) => {
            return Error::GasExhausted {
                descriptor: oog.descriptor,
            }
        }
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<OccAbortPanic>() {
        Ok(abort) => {
            return Error::OccAbort {
                dependency: abort.dependency,
            }
        }
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Error>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return Error::Panic(msg.to_string());
    }
    match payload.downcast::<String>() {
        Ok(msg) => Error::Panic(*msg),
        Err(_) => Error::Panic("unknown panic".into()),
    }
}

type BuiltinHandler = fn(&Error, GasInfo) -> Option<Error>;

/// OCC aborts stay retryable and untouched.
fn recover_occ_abort(err: &Error, _: GasInfo) -> Option<Error> {
    err.occ_dependency()
        .map(|dependency| Error::OccAbort { dependency })
}

/// Gas exhaustion anywhere in the transaction reports the gas wanted.
fn recover_out_of_gas(err: &Error, gas: GasInfo) -> Option<Error> {
    fn descriptor(err: &Error) -> Option<&str> {
        match err {
            Error::GasExhausted { descriptor } => Some(descriptor),
            Error::MessageFailed { source, .. } => descriptor(source),
            _ => None,
        }
    }
    descriptor(err).map(|descriptor| Error::OutOfGas {
        descriptor: descriptor.to_string(),
        gas_wanted: gas.gas_wanted,
        gas_used: gas.gas_used,
    })
}

fn recover_default(err: &Error, _: GasInfo) -> Option<Error> {
    Some(err.clone())
}

const BUILTIN: [BuiltinHandler; 3] = [recover_occ_abort, recover_out_of_gas, recover_default];

#[derive(Clone, Default)]
pub struct RecoveryChain {
    custom: Vec<RecoveryHandler>,
}

impl RecoveryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler consulted before every handler added earlier.
    pub fn push(&mut self, handler: RecoveryHandler) {
        self.custom.push(handler);
    }

    pub fn recover(&self, err: Error, gas: GasInfo) -> Error {
        if let Some(recovered) = self.custom.iter().rev().find_map(|handler| handler(&err)) {
            return recovered;
        }
        BUILTIN
            .iter()
            .find_map(|handler| handler(&err, gas))
            .unwrap_or(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::panic;

    fn caught(f: impl FnOnce() + panic::UnwindSafe) -> Error {
        let payload = panic::catch_unwind(f).expect_err("closure must panic");
        panic_to_error(payload)
    }

    const GAS: GasInfo = GasInfo {
        gas_wanted: 100,
        gas_used: 120,
    };

    #[test]
    fn test_panic_payloads() {
        assert_eq!(caught(|| panic!("boom")), Error::Panic("boom".into()));
        assert_eq!(
            caught(|| panic!("{} {}", "formatted", 1)),
            Error::Panic("formatted 1".into())
        );
        assert_matches!(
            caught(|| panic::panic_any(OutOfGasPanic {
                descriptor: "wasm".into()
            })),
            Error::GasExhausted { descriptor } if descriptor == "wasm"
        );
        assert_eq!(
            caught(|| panic::panic_any(OccAbortPanic { dependency: 2 })),
            Error::OccAbort { dependency: 2 }
        );
    }

    #[test]
    fn test_out_of_gas_carries_gas_wanted() {
        let chain = RecoveryChain::new();
        let err = Error::MessageFailed {
            index: 0,
            source: Box::new(Error::GasExhausted {
                descriptor: "WriteFlat".into(),
            }),
        };
        assert_eq!(
            chain.recover(err, GAS),
            Error::OutOfGas {
                descriptor: "WriteFlat".into(),
                gas_wanted: 100,
                gas_used: 120,
            }
        );
    }

    #[test]
    fn test_occ_abort_stays_retryable() {
        let chain = RecoveryChain::new();
        let err = Error::MessageFailed {
            index: 1,
            source: Box::new(Error::OccAbort { dependency: 4 }),
        };
        assert_eq!(chain.recover(err, GAS), Error::OccAbort { dependency: 4 });
    }

    #[test]
    fn test_custom_handlers_checked_first_newest_first() {
        let mut chain = RecoveryChain::new();
        chain.push(Arc::new(|_| Some(Error::Panic("first".into()))));
        chain.push(Arc::new(|err| match err {
            Error::Panic(msg) if msg == "vm" => Some(Error::custom("wasm", 5, "contract panicked")),
            _ => None,
        }));

        assert_eq!(
            chain.recover(Error::Panic("vm".into()), GAS),
            Error::custom("wasm", 5, "contract panicked")
        );
        assert_eq!(
            chain.recover(Error::Panic("other".into()), GAS),
            Error::Panic("first".into())
        );
    }

    #[test]
    fn test_default_passes_through() {
        let err = Error::Unauthorized("bad signature".into());
        assert_eq!(RecoveryChain::new().recover(err.clone(), GAS), err);
    }
}
