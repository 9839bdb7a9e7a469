//! Error taxonomy shared by every vault operation.

use bitcoin::Amount;
use thiserror::Error;

/// Errors from key normalization, script compilation and PSBT handling.
///
/// All failures are local and synchronous. Nothing here is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaultError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid profile parameters: {0}")]
    InvalidProfileParameters(String),

    #[error("Address derivation failed: {0}")]
    AddressDerivationError(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("No UTXOs to spend")]
    NoUtxos,

    #[error("Insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error("Output amount {0} is below the dust limit")]
    DustOutput(Amount),

    #[error("Fee rate {0} sat/vB is outside the accepted range")]
    InvalidFeeRate(f64),

    #[error("Invalid PSBT: {0}")]
    InvalidPsbtFormat(String),

    #[error("Incomplete PSBT: input {input} has {have} of {need} required signatures")]
    IncompletePsbt {
        input: usize,
        have: usize,
        need: usize,
    },

    #[error("Spend path mismatch: {0}")]
    SpendPathMismatch(String),

    #[error("Invalid signature on input {input} for key {key}")]
    InvalidSignature { input: usize, key: String },

    #[error("PSBT input {0} is already finalized")]
    AlreadyFinalized(usize),

    #[error("Transaction extraction failed: {0}")]
    Extraction(String),

    #[error("Backup error: {0}")]
    Backup(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
