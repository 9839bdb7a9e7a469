//! Witness assembly and transaction extraction.
//!
//! The witness stack for each input is built from the path's [`WitnessShape`]:
//!
//! ```text
//! Checksig:  <sig> <01|>                     (01 = IF branch, empty = ELSE)
//! Multisig:  <> <sig_1> .. <sig_k> <01|>     (signatures in BIP-67 key order)
//! Thresh:    <01|> <slot_n> .. <slot_1>      (slot = signature or empty)
//! ```
//!
//! followed by the witness script itself.

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash as _;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, Verification};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{FeeRate, Sequence, Transaction, Txid, Witness};

use crate::error::{Result, VaultError};
use crate::profile::{SpendPath, SpendPlan, WitnessShape};
use crate::vault::Vault;

/// Fee-rate ceiling applied on extraction: twice [`crate::psbt::MAX_FEE_RATE`].
///
/// The builder prices fees on a worst-case size, so a signed transaction
/// built at the maximum rate pays slightly more per vbyte than requested.
const MAX_EXTRACT_FEE_RATE: FeeRate = FeeRate::from_sat_per_kwu(250_000);

const EMPTY: &[u8] = &[];
const TRUE: &[u8] = &[0x01];

/// A fully signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct FinalizedTx {
    pub tx: Transaction,
    pub txid: Txid,
    /// Consensus-encoded transaction.
    pub hex: String,
}

/// Assemble witnesses for every input of `psbt` and extract the transaction.
pub fn finalize_psbt(mut psbt: Psbt, vault: &Vault, path: SpendPath) -> Result<FinalizedTx> {
    let plan = vault.spend_plan(path)?;
    check_timelocks(&psbt.unsigned_tx, &plan)?;

    let secp = Secp256k1::verification_only();
    let mut witnesses = Vec::with_capacity(psbt.inputs.len());
    {
        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        for (index, input) in psbt.inputs.iter().enumerate() {
            check_input(index, input, vault)?;
            verify_signatures(&secp, &mut cache, index, input, vault, &plan)?;
            witnesses.push(build_witness(index, input, vault, &plan.shape)?);
        }
    }

    for (input, witness) in psbt.inputs.iter_mut().zip(witnesses) {
        input.final_script_witness = Some(witness);
        input.partial_sigs.clear();
        input.sighash_type = None;
        input.witness_script = None;
    }

    let tx = psbt
        .extract_tx_with_fee_rate_limit(MAX_EXTRACT_FEE_RATE)
        .map_err(|e| VaultError::Extraction(e.to_string()))?;
    let txid = tx.compute_txid();
    let hex = serialize_hex(&tx);

    log::info!("Finalized {} path spend {}", path, txid);
    Ok(FinalizedTx { tx, txid, hex })
}

/// The transaction must carry the nLockTime / nSequence its path needs.
fn check_timelocks(tx: &Transaction, plan: &SpendPlan) -> Result<()> {
    if plan.path == SpendPath::Primary {
        return Ok(());
    }

    if plan.sequence == Sequence::ENABLE_LOCKTIME_NO_RBF {
        if !plan.lock_time.is_implied_by(tx.lock_time) {
            return Err(VaultError::SpendPathMismatch(format!(
                "nLockTime {} does not satisfy lock {}",
                tx.lock_time, plan.lock_time
            )));
        }
        if tx.input.iter().any(|i| i.sequence == Sequence::MAX) {
            return Err(VaultError::SpendPathMismatch(
                "final nSequence disables the lock time".into(),
            ));
        }
    } else {
        // BIP-68 relative locks are only enforced from version 2
        if tx.version.0 < Version::TWO.0 {
            return Err(VaultError::SpendPathMismatch(format!(
                "version {} does not enforce relative lock {}",
                tx.version.0, plan.sequence
            )));
        }
        if let Some(input) = tx.input.iter().find(|i| i.sequence != plan.sequence) {
            return Err(VaultError::SpendPathMismatch(format!(
                "nSequence {} does not match relative lock {}",
                input.sequence, plan.sequence
            )));
        }
    }
    Ok(())
}

fn check_input(index: usize, input: &Input, vault: &Vault) -> Result<()> {
    if input.final_script_witness.is_some() {
        return Err(VaultError::AlreadyFinalized(index));
    }
    match &input.witness_script {
        Some(script) if script == vault.script() => {}
        Some(_) => {
            return Err(VaultError::InvalidPsbtFormat(format!(
                "input {} witness script does not match the vault",
                index
            )))
        }
        None => {
            return Err(VaultError::InvalidPsbtFormat(format!(
                "input {} has no witness script",
                index
            )))
        }
    }
    match &input.witness_utxo {
        Some(out) if out.script_pubkey == vault.script_pubkey() => Ok(()),
        Some(_) => Err(VaultError::InvalidPsbtFormat(format!(
            "input {} does not spend the vault address",
            index
        ))),
        None => Err(VaultError::InvalidPsbtFormat(format!(
            "input {} has no witness UTXO",
            index
        ))),
    }
}

fn verify_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    input: &Input,
    vault: &Vault,
    plan: &SpendPlan,
) -> Result<()> {
    let value = input
        .witness_utxo
        .as_ref()
        .map(|o| o.value)
        .ok_or_else(|| VaultError::InvalidPsbtFormat(format!("input {} has no value", index)))?;

    for (key, sig) in &input.partial_sigs {
        if !key.compressed || !plan.shape.signers().contains(&key.inner) {
            log::warn!("Input {} signed by a key outside the {} path", index, plan.path);
            return Err(VaultError::SpendPathMismatch(format!(
                "key {} cannot sign the {} path",
                key, plan.path
            )));
        }

        let sighash = cache
            .p2wsh_signature_hash(index, vault.script(), value, sig.sighash_type)
            .map_err(|e| VaultError::InvalidPsbtFormat(e.to_string()))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        secp.verify_ecdsa(&msg, &sig.signature, &key.inner)
            .map_err(|_| VaultError::InvalidSignature {
                input: index,
                key: key.to_string(),
            })?;
    }
    Ok(())
}

fn signature_for(input: &Input, key: &PublicKey) -> Option<ecdsa::Signature> {
    input
        .partial_sigs
        .get(&bitcoin::PublicKey::new(*key))
        .copied()
}

/// Signatures from `keys`, in the order given, stopping at `needed`.
fn collect_signatures(
    index: usize,
    input: &Input,
    keys: &[PublicKey],
    needed: usize,
) -> Result<Vec<(PublicKey, ecdsa::Signature)>> {
    let found: Vec<_> = keys
        .iter()
        .filter_map(|k| signature_for(input, k).map(|sig| (*k, sig)))
        .take(needed)
        .collect();
    if found.len() < needed {
        return Err(VaultError::IncompletePsbt {
            input: index,
            have: found.len(),
            need: needed,
        });
    }
    Ok(found)
}

fn build_witness(index: usize, input: &Input, vault: &Vault, shape: &WitnessShape) -> Result<Witness> {
    let mut witness = Witness::new();
    let flag = |branch: bool| if branch { TRUE } else { EMPTY };

    match shape {
        WitnessShape::Checksig { key, branch } => {
            let sigs = collect_signatures(index, input, std::slice::from_ref(key), 1)?;
            for (_, sig) in &sigs {
                witness.push(sig.to_vec());
            }
            witness.push(flag(*branch));
        }
        WitnessShape::Multisig {
            threshold,
            keys,
            branch,
        } => {
            // OP_CHECKMULTISIG pops one element too many
            witness.push(EMPTY);
            for (_, sig) in collect_signatures(index, input, keys, *threshold)? {
                witness.push(sig.to_vec());
            }
            witness.push(flag(*branch));
        }
        WitnessShape::Thresh {
            required,
            keys,
            timelock,
        } => {
            let chosen = collect_signatures(index, input, keys, *required)?;
            // The timelock term is consumed last, so its selector sits deepest.
            witness.push(flag(!*timelock));
            for key in keys.iter().rev() {
                match chosen.iter().find(|(k, _)| k == key) {
                    Some((_, sig)) => witness.push(sig.to_vec()),
                    None => witness.push(EMPTY),
                }
            }
        }
    }

    witness.push(vault.script().as_bytes());
    Ok(witness)
}
