use crate::utxo::Amount;
use thiserror::Error;

/// Errors surfaced by the ledger core.
///
/// Storage failures from the persistence layer arrive as `anyhow::Error`
/// and are wrapped verbatim so callers can still print the context chain.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    #[error("signature invalid for wallet {0}")]
    SignatureInvalid(String),

    #[error("chain integrity violated at block #{index}: {reason}")]
    StructuralIntegrity { index: u64, reason: String },

    #[error("proof-of-work gave up after {0} attempts")]
    PowExhausted(u64),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub fn integrity(index: u64, reason: impl Into<String>) -> Self {
        LedgerError::StructuralIntegrity { index, reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
