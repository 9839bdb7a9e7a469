//! Unsigned PSBT construction for vault spends and check-ins.
//!
//! # Flow
//!
//! 1. Build an unsigned PSBT with [`build_spend_psbt`] or [`build_checkin_psbt`]
//! 2. The caller signs it externally (hardware wallet, software signer)
//! 3. Re-import with [`crate::validate::validate_psbt`], then
//!    [`crate::finalize::finalize_psbt`]
//!
//! Every PSBT input carries `witness_utxo`, `witness_script` and
//! `sighash_type = ALL`, which is all a BIP-143 signer needs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::address::address_is_valid_for;
use crate::error::{Result, VaultError};
use crate::profile::{SpendPath, SpendPlan, WitnessShape};
use crate::vault::Vault;

/// Maximum fee rate we'll accept (sat/vB). Protects against malicious fee data.
pub const MAX_FEE_RATE: f64 = 500.0;

/// BIP-174 magic bytes.
pub const PSBT_MAGIC: &[u8; 5] = b"psbt\xff";

/// DER signature (max 72 bytes) plus sighash byte.
const MAX_SIG_LEN: usize = 73;

/// A confirmed output locked to a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    /// Confirmation height. Relative timelocks count from here.
    pub height: u32,
}

/// Fee tier selected for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePriority {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for FeePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeePriority::Low => write!(f, "low"),
            FeePriority::Medium => write!(f, "medium"),
            FeePriority::High => write!(f, "high"),
        }
    }
}

impl FromStr for FeePriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "economy" => Ok(FeePriority::Low),
            "medium" | "normal" => Ok(FeePriority::Medium),
            "high" | "urgent" => Ok(FeePriority::High),
            other => Err(format!("unknown fee priority '{}'", other)),
        }
    }
}

/// Caller-supplied fee rates per tier, in sat/vB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeRates {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl FeeRates {
    /// The rate for `priority`, rejected unless `0 < rate <= MAX_FEE_RATE`.
    pub fn rate_for(&self, priority: FeePriority) -> Result<f64> {
        let rate = match priority {
            FeePriority::Low => self.low,
            FeePriority::Medium => self.medium,
            FeePriority::High => self.high,
        };
        if !rate.is_finite() || rate <= 0.0 || rate > MAX_FEE_RATE {
            return Err(VaultError::InvalidFeeRate(rate));
        }
        Ok(rate)
    }
}

/// What a spend should do.
#[derive(Debug, Clone)]
pub struct SpendIntent {
    pub destination: Address,
    pub priority: FeePriority,
    pub path: SpendPath,
    /// The heir expected to sign. Must belong to the chosen branch.
    pub heir: Option<PublicKey>,
}

/// An unsigned vault PSBT and what went into it.
#[derive(Debug, Clone)]
pub struct VaultPsbt {
    pub psbt: Psbt,
    pub plan: SpendPlan,
    pub send_amount: Amount,
    pub fee: Amount,
    /// Effective fee rate in sat/vB.
    pub fee_rate: f64,
    pub vsize: usize,
}

/// Build an unsigned PSBT spending every UTXO to `intent.destination`.
pub fn build_spend_psbt(
    vault: &Vault,
    utxos: &[Utxo],
    intent: &SpendIntent,
    rates: &FeeRates,
) -> Result<VaultPsbt> {
    if !address_is_valid_for(&intent.destination.to_string(), vault.network) {
        return Err(VaultError::UnsupportedNetwork(format!(
            "destination {} is not a {} address",
            intent.destination, vault.network
        )));
    }

    let plan = vault.spend_plan(intent.path)?;
    if let Some(heir) = intent.heir {
        if !plan.shape.signers().contains(&heir) {
            log::warn!("Heir key is not a signer on the {} path", intent.path);
            return Err(VaultError::SpendPathMismatch(format!(
                "key {} cannot sign the {} path",
                heir, intent.path
            )));
        }
    }

    build(vault, utxos, plan, intent.destination.script_pubkey(), intent.priority, rates)
}

/// Build an unsigned check-in: a primary-path spend back to the vault's own
/// address. Resets a dead man's switch; for absolute timelocks it only proves
/// the owner is alive.
pub fn build_checkin_psbt(
    vault: &Vault,
    utxos: &[Utxo],
    priority: FeePriority,
    rates: &FeeRates,
) -> Result<VaultPsbt> {
    let plan = vault.spend_plan(SpendPath::Primary)?;
    build(vault, utxos, plan, vault.script_pubkey(), priority, rates)
}

fn build(
    vault: &Vault,
    utxos: &[Utxo],
    plan: SpendPlan,
    output_script: ScriptBuf,
    priority: FeePriority,
    rates: &FeeRates,
) -> Result<VaultPsbt> {
    if utxos.is_empty() {
        return Err(VaultError::NoUtxos);
    }
    let fee_rate = rates.rate_for(priority)?;

    let total_in: Amount = utxos.iter().map(|u| u.value).sum();
    let vsize = estimate_spend_vbytes(
        &plan.shape,
        vault.script().len(),
        utxos.len(),
        output_script.len(),
    );
    let fee = Amount::from_sat((vsize as f64 * fee_rate).ceil() as u64);

    let send_amount = match total_in.checked_sub(fee) {
        Some(amount) if amount > Amount::ZERO => amount,
        _ => {
            return Err(VaultError::InsufficientFunds {
                needed: fee,
                available: total_in,
            })
        }
    };
    if send_amount < output_script.minimal_non_dust() {
        return Err(VaultError::DustOutput(send_amount));
    }

    let inputs: Vec<TxIn> = utxos
        .iter()
        .map(|u| TxIn {
            previous_output: u.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: plan.sequence,
            witness: Witness::default(),
        })
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: plan.lock_time,
        input: inputs,
        output: vec![TxOut {
            value: send_amount,
            script_pubkey: output_script,
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| VaultError::InvalidPsbtFormat(format!("PSBT creation failed: {}", e)))?;

    for (input, utxo) in psbt.inputs.iter_mut().zip(utxos) {
        input.witness_utxo = Some(vault.txout(utxo.value));
        input.witness_script = Some(vault.script().clone());
        input.sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));
    }

    log::info!(
        "Built {} path PSBT: {} inputs, {} out, fee {} ({:.1} sat/vB)",
        plan.path,
        utxos.len(),
        send_amount,
        fee,
        fee_rate
    );

    Ok(VaultPsbt {
        psbt,
        plan,
        send_amount,
        fee,
        fee_rate,
        vsize,
    })
}

/// Estimate the virtual size of a vault spend with one output.
///
/// Signatures are sized at their 73-byte maximum, so the estimate never
/// undershoots.
pub fn estimate_spend_vbytes(
    shape: &WitnessShape,
    script_len: usize,
    num_inputs: usize,
    output_script_len: usize,
) -> usize {
    // version + locktime + input count + output count
    let base = 4 + 4 + varint_len(num_inputs) + 1;
    // outpoint + empty scriptSig + sequence
    let input = 32 + 4 + 1 + 4;
    let output = 8 + varint_len(output_script_len) + output_script_len;

    let sig_item = 1 + MAX_SIG_LEN;
    let items = match shape {
        WitnessShape::Checksig { branch, .. } => sig_item + flag_len(*branch),
        WitnessShape::Multisig {
            threshold, branch, ..
        } => 1 + threshold * sig_item + flag_len(*branch),
        WitnessShape::Thresh {
            required,
            keys,
            timelock,
        } => flag_len(!*timelock) + required * sig_item + (keys.len() - required),
    };
    let element_count = match shape {
        WitnessShape::Checksig { .. } => 3,
        WitnessShape::Multisig { threshold, .. } => threshold + 3,
        WitnessShape::Thresh { keys, .. } => keys.len() + 2,
    };
    let witness = varint_len(element_count) + items + varint_len(script_len) + script_len;

    // marker + flag count as 2 weight units
    let weight = 4 * (base + num_inputs * input + output) + 2 + num_inputs * witness;
    weight.div_ceil(4)
}

/// Serialize a PSBT as BIP-174 base64.
pub fn encode_psbt(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

/// Parse a PSBT from base64 or hex.
pub fn decode_psbt(input: &str) -> Result<Psbt> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(VaultError::InvalidPsbtFormat("empty input".into()));
    }

    let bytes = if trimmed.len() % 2 == 0 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(trimmed).map_err(|e| VaultError::InvalidPsbtFormat(format!("hex: {}", e)))?
    } else {
        BASE64
            .decode(trimmed)
            .map_err(|e| VaultError::InvalidPsbtFormat(format!("base64: {}", e)))?
    };

    if !bytes.starts_with(PSBT_MAGIC) {
        return Err(VaultError::InvalidPsbtFormat("missing psbt magic bytes".into()));
    }

    Psbt::deserialize(&bytes).map_err(|e| VaultError::InvalidPsbtFormat(e.to_string()))
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}

/// `0x01` costs a length byte plus one; the empty push only its length byte.
fn flag_len(set: bool) -> usize {
    if set {
        2
    } else {
        1
    }
}
