//! Wallet errors

use thiserror::Error;

use crate::core::{AddressError, AmountError, ScriptError, SigHashError, TransactionError};
use crate::crypto::KeyError;
use crate::multisig::MultisigError;
use crate::scanner::rpc::RpcError;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Too many inputs: selected {selected}, limit {max}")]
    TooManyInputs { selected: usize, max: usize },
    #[error("No destinations")]
    NoDestinations,
    #[error("Zero amount for destination {0}")]
    ZeroAmount(String),
    #[error("Amount total overflows u64")]
    AmountOverflow,
    #[error("{descriptors} unlock descriptors for {inputs} inputs")]
    UnlockCountMismatch { inputs: usize, descriptors: usize },
    #[error("Input {index}: unsupported lock script ({script_type})")]
    UnsupportedScript { index: usize, script_type: String },
    #[error("Input {index}: missing {what}")]
    MissingUnlockData { index: usize, what: &'static str },
    #[error("Input {index}: signature error: {source}")]
    Signature {
        index: usize,
        #[source]
        source: KeyError,
    },
    #[error("Input {index}: verification failed: {reason}")]
    VerifyFailed { index: usize, reason: String },
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Sighash error: {0}")]
    SigHash(#[from] SigHashError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Amount error: {0}")]
    Amount(#[from] AmountError),
    #[error("Multisig error: {0}")]
    Multisig(#[from] MultisigError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

impl WalletError {
    /// Sum amounts, failing instead of wrapping
    pub(crate) fn checked_total(amounts: impl IntoIterator<Item = u64>) -> Result<u64, Self> {
        amounts
            .into_iter()
            .try_fold(0u64, |total, amount| total.checked_add(amount))
            .ok_or(WalletError::AmountOverflow)
    }

    pub(crate) fn verify(index: usize, reason: impl Into<String>) -> Self {
        WalletError::VerifyFailed {
            index,
            reason: reason.into(),
        }
    }
}
