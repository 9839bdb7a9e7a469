//! HeirVault Inheritance Module
//!
//! Bitcoin inheritance vaults enforced by consensus rules alone: P2WSH
//! witness scripts that let an owner spend at any time and open a recovery
//! path to heirs once a timelock or quorum condition is met.
//!
//! # Concepts
//!
//! - **Primary path**: owner (or the full quorum) can always spend
//! - **Recovery path**: heirs (or a decayed quorum) can spend after a lock
//! - **Check-in**: owner spends and recreates the UTXO to reset a relative lock
//!
//! # Flow
//!
//! ```text
//! VaultConfig -> keys -> profile -> script -> address      (vault creation)
//! psbt -> external signer -> validate -> finalize          (spending)
//! ```

pub mod address;
pub mod backup;
pub mod checkin;
pub mod config;
pub mod error;
pub mod finalize;
pub mod heartbeat;
pub mod keys;
pub mod profile;
pub mod psbt;
pub mod script;
pub mod spend_analysis;
pub mod validate;
pub mod vault;

#[cfg(test)]
pub(crate) mod test_utils;

pub use address::{address_is_valid_for, derive_address, parse_network};
pub use error::{Result, VaultError};
pub use finalize::{finalize_psbt, FinalizedTx};
pub use keys::{normalize_key, parse_key};
pub use profile::{SpendPath, SpendPlan, VaultProfile, WitnessShape};
pub use psbt::{
    build_checkin_psbt, build_spend_psbt, decode_psbt, encode_psbt, FeePriority, FeeRates,
    SpendIntent, Utxo,
};
pub use script::{compile, thresh_descriptor, SpendPathInfo, WitnessScript};
pub use validate::{validate_psbt, PsbtReport, PsbtState};
pub use vault::Vault;
