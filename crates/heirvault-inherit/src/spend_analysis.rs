//! Spend path detection via witness analysis
//!
//! A P2WSH spend reveals the witness script as its last witness element. Once
//! that script is confirmed to be the vault's, the branch selector tells the
//! paths apart:
//!
//! - IF/ELSE scripts: the element just below the script is `01` for the
//!   primary branch and empty for recovery.
//! - ThreshDecay: the deepest element selects the timelock term, `01` when it
//!   is skipped (primary) and empty when it is used (recovery).
//!
//! Timing is a fallback for malformed witnesses: a spend confirmed before the
//! recovery lock opened can only have used the primary path.

use bitcoin::{OutPoint, Transaction, Witness};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::profile::{RecoveryLock, SpendPath, VaultProfile};
use crate::vault::Vault;

/// Result of analyzing a vault spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendAnalysis {
    /// `None` when the path could not be determined.
    pub path: Option<SpendPath>,
    pub method: DetectionMethod,
    /// Number of witness items, excluding the witness script.
    pub witness_stack_size: usize,
    /// Non-empty items that look like signatures.
    pub signatures: usize,
}

/// How the spend path was determined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DetectionMethod {
    /// Read from the branch selector in the witness.
    WitnessAnalysis,
    /// Inferred from timing (spend before the lock opened = primary).
    TimelockTiming,
    Indeterminate,
}

/// Classify a witness spending `vault`.
///
/// Fails with `SpendPathMismatch` if the witness reveals a different script.
pub fn analyze_witness(vault: &Vault, witness: &Witness) -> Result<SpendAnalysis> {
    let items: Vec<&[u8]> = witness.iter().collect();
    let Some((script, stack)) = items.split_last() else {
        return Ok(indeterminate(0, 0));
    };
    if *script != vault.script().as_bytes() {
        return Err(VaultError::SpendPathMismatch(
            "witness reveals a different script".into(),
        ));
    }

    let signatures = stack.iter().filter(|item| looks_like_signature(item)).count();

    let selector = match vault.profile {
        VaultProfile::ThreshDecay { ref pubkeys, .. } => {
            if stack.len() != pubkeys.len() + 1 {
                return Ok(indeterminate(stack.len(), signatures));
            }
            stack.first().copied()
        }
        VaultProfile::MultisigDecay { .. } => {
            if stack.len() < 3 || !stack[0].is_empty() {
                return Ok(indeterminate(stack.len(), signatures));
            }
            stack.last().copied()
        }
        VaultProfile::Timelock { .. } | VaultProfile::DeadManSwitch { .. } => {
            if stack.len() != 2 {
                return Ok(indeterminate(stack.len(), signatures));
            }
            stack.last().copied()
        }
    };

    let path = match selector {
        Some([0x01]) => SpendPath::Primary,
        Some([]) => SpendPath::Recovery,
        _ => return Ok(indeterminate(stack.len(), signatures)),
    };

    Ok(SpendAnalysis {
        path: Some(path),
        method: DetectionMethod::WitnessAnalysis,
        witness_stack_size: stack.len(),
        signatures,
    })
}

/// Whether the recovery path could have been used by a spend confirmed at
/// `spend_height`. Returns `Some(Primary)` when it could not.
///
/// Timestamp locks return `None`: heights alone cannot settle them.
pub fn analyze_timing(vault: &Vault, spend_height: u32, utxo_height: u32) -> Option<SpendPath> {
    let opened = match vault.profile.recovery_lock().ok()? {
        // BIP-68: spendable in block utxo_height + n.
        RecoveryLock::Relative(sequence) => {
            let blocks = u32::from(sequence.to_consensus_u32() as u16);
            spend_height.saturating_sub(utxo_height) >= blocks
        }
        // nLockTime L is final from block L + 1.
        RecoveryLock::Absolute(lock) if lock.is_block_height() => {
            spend_height > lock.to_consensus_u32()
        }
        RecoveryLock::Absolute(_) => return None,
    };
    if opened {
        None
    } else {
        Some(SpendPath::Primary)
    }
}

/// Combined analysis: witness first, timing as fallback.
///
/// Pass 0 for either height when it is unknown.
pub fn analyze_spend(
    vault: &Vault,
    witness: &Witness,
    spend_height: u32,
    utxo_height: u32,
) -> Result<SpendAnalysis> {
    let mut analysis = analyze_witness(vault, witness)?;

    if analysis.path.is_none() && spend_height > 0 && utxo_height > 0 {
        if let Some(path) = analyze_timing(vault, spend_height, utxo_height) {
            analysis.path = Some(path);
            analysis.method = DetectionMethod::TimelockTiming;
        }
    }

    if analysis.path == Some(SpendPath::Recovery) {
        log::info!("Vault {} was spent through its recovery path", vault.address);
    }
    Ok(analysis)
}

/// Find the input of `tx` spending `outpoint` and analyze its witness.
pub fn analyze_transaction_for_outpoint(
    vault: &Vault,
    tx: &Transaction,
    outpoint: &OutPoint,
) -> Result<Option<SpendAnalysis>> {
    tx.input
        .iter()
        .find(|input| &input.previous_output == outpoint)
        .map(|input| analyze_witness(vault, &input.witness))
        .transpose()
}

fn looks_like_signature(item: &[u8]) -> bool {
    (9..=73).contains(&item.len()) && item[0] == 0x30
}

fn indeterminate(witness_stack_size: usize, signatures: usize) -> SpendAnalysis {
    SpendAnalysis {
        path: None,
        method: DetectionMethod::Indeterminate,
        witness_stack_size,
        signatures,
    }
}
