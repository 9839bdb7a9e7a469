//! Structural checks on a PSBT coming back from an external signer.
//!
//! Nothing here verifies signatures; that happens in [`crate::finalize`].

use bitcoin::psbt::Psbt;
use serde::Serialize;

use crate::error::{Result, VaultError};
use crate::psbt::decode_psbt;
use crate::vault::Vault;

/// Where a PSBT is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PsbtState {
    Unsigned,
    PartiallySigned,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputReport {
    pub index: usize,
    pub signatures: usize,
    pub finalized: bool,
    /// `None` when no vault was given to compare against.
    pub matches_vault: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsbtReport {
    pub input_count: usize,
    pub output_count: usize,
    pub state: PsbtState,
    pub inputs: Vec<InputReport>,
    pub matches_vault: Option<bool>,
    /// Sum of `witness_utxo` values, when every input carries one.
    pub total_input_sat: Option<u64>,
    pub fee_sat: Option<u64>,
}

/// Decode a base64 or hex PSBT and report on its structure.
pub fn validate_psbt(input: &str, vault: Option<&Vault>) -> Result<PsbtReport> {
    let psbt = decode_psbt(input)?;
    inspect_psbt(&psbt, vault)
}

/// Report on an already-decoded PSBT.
pub fn inspect_psbt(psbt: &Psbt, vault: Option<&Vault>) -> Result<PsbtReport> {
    let tx = &psbt.unsigned_tx;
    if tx.input.is_empty() {
        return Err(VaultError::InvalidPsbtFormat("PSBT has no inputs".into()));
    }
    if tx.output.is_empty() {
        return Err(VaultError::InvalidPsbtFormat("PSBT has no outputs".into()));
    }

    let mut inputs = Vec::with_capacity(psbt.inputs.len());
    for (index, input) in psbt.inputs.iter().enumerate() {
        let finalized = input.final_script_witness.is_some();
        if input.witness_script.is_none() && !finalized {
            log::warn!("PSBT input {} carries no witness script", index);
            return Err(VaultError::InvalidPsbtFormat(format!(
                "input {} has no witness script",
                index
            )));
        }

        let matches_vault = vault.map(|v| {
            let script_ok = match (&input.witness_script, &input.final_script_witness) {
                (Some(script), _) => script == v.script(),
                (None, Some(witness)) => witness.last() == Some(v.script().as_bytes()),
                (None, None) => false,
            };
            let spk_ok = input
                .witness_utxo
                .as_ref()
                .is_some_and(|out| out.script_pubkey == v.script_pubkey());
            script_ok && spk_ok
        });

        inputs.push(InputReport {
            index,
            signatures: input.partial_sigs.len(),
            finalized,
            matches_vault,
        });
    }

    let state = if inputs.iter().all(|i| i.finalized) {
        PsbtState::Finalized
    } else if inputs.iter().any(|i| i.signatures > 0 || i.finalized) {
        PsbtState::PartiallySigned
    } else {
        PsbtState::Unsigned
    };

    let total_input_sat = psbt
        .inputs
        .iter()
        .map(|i| i.witness_utxo.as_ref().map(|o| o.value.to_sat()))
        .sum::<Option<u64>>();
    let total_output_sat: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    let fee_sat = total_input_sat.and_then(|total| total.checked_sub(total_output_sat));

    let matches_vault = vault.map(|_| inputs.iter().all(|i| i.matches_vault == Some(true)));

    Ok(PsbtReport {
        input_count: tx.input.len(),
        output_count: tx.output.len(),
        state,
        inputs,
        matches_vault,
        total_input_sat,
        fee_sat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SpendPath;
    use crate::psbt::{build_spend_psbt, encode_psbt, FeePriority, SpendIntent};
    use crate::test_utils::{
        make_utxo, make_vault, multisig_decay_profile, sign_psbt, test_destination,
        test_fee_rates, test_keypair, timelock_profile,
    };
    use crate::vault::Vault;
    use base64::Engine as _;

    fn unsigned(vault: &Vault) -> Psbt {
        let intent = SpendIntent {
            destination: test_destination(),
            priority: FeePriority::Medium,
            path: SpendPath::Primary,
            heir: None,
        };
        let utxos = [
            make_utxo(0xAA, 0, 50_000, 850_000),
            make_utxo(0xBB, 0, 50_000, 850_000),
        ];
        build_spend_psbt(vault, &utxos, &intent, &test_fee_rates())
            .unwrap()
            .psbt
    }

    #[test]
    fn test_unsigned_report() {
        let vault = make_vault(timelock_profile(900_000));
        let psbt = unsigned(&vault);
        let report = validate_psbt(&encode_psbt(&psbt), Some(&vault)).unwrap();

        assert_eq!(report.input_count, 2);
        assert_eq!(report.output_count, 1);
        assert_eq!(report.state, PsbtState::Unsigned);
        assert_eq!(report.matches_vault, Some(true));
        assert_eq!(report.total_input_sat, Some(100_000));
        assert!(report.fee_sat.unwrap() > 0);
        assert!(report.inputs.iter().all(|i| i.signatures == 0));
    }

    #[test]
    fn test_partially_signed_report() {
        let vault = make_vault(multisig_decay_profile(900_000));
        let mut psbt = unsigned(&vault);
        sign_psbt(&mut psbt, &test_keypair(1).0);

        let hex_form = hex::encode(psbt.serialize());
        let report = validate_psbt(&hex_form, None).unwrap();
        assert_eq!(report.state, PsbtState::PartiallySigned);
        assert_eq!(report.matches_vault, None);
        assert!(report.inputs.iter().all(|i| i.signatures == 1));

        sign_psbt(&mut psbt, &test_keypair(2).0);
        let report = inspect_psbt(&psbt, Some(&vault)).unwrap();
        assert!(report.inputs.iter().all(|i| i.signatures == 2));
    }

    #[test]
    fn test_foreign_vault_flagged() {
        let vault = make_vault(timelock_profile(900_000));
        let other = make_vault(timelock_profile(900_001));
        let report = inspect_psbt(&unsigned(&vault), Some(&other)).unwrap();
        assert_eq!(report.matches_vault, Some(false));
        assert!(report.inputs.iter().all(|i| i.matches_vault == Some(false)));
    }

    #[test]
    fn test_missing_witness_script_rejected() {
        let vault = make_vault(timelock_profile(900_000));
        let mut psbt = unsigned(&vault);
        psbt.inputs[1].witness_script = None;
        assert!(matches!(
            inspect_psbt(&psbt, None),
            Err(VaultError::InvalidPsbtFormat(_))
        ));
    }

    #[test]
    fn test_not_a_psbt() {
        let bogus = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        assert!(matches!(
            validate_psbt(&bogus, None),
            Err(VaultError::InvalidPsbtFormat(_))
        ));
        assert!(validate_psbt("", None).is_err());
    }
}
