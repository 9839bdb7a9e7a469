//! One-shot commands. Each returns the JSON document `main` prints.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use bitcoin::{Amount, OutPoint, Transaction};
use serde_json::{json, Value};

use heirvault_inherit::address::parse_address;
use heirvault_inherit::backup::VaultBackup;
use heirvault_inherit::heartbeat::{evaluate_heartbeat, ChainPosition};
use heirvault_inherit::spend_analysis::analyze_spend;
use heirvault_inherit::{
    build_checkin_psbt, build_spend_psbt, decode_psbt, encode_psbt, finalize_psbt, parse_key,
    validate_psbt, FeePriority, SpendIntent, SpendPath, Utxo, Vault,
};

use crate::config::CliConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Compile the configured vault and print its script and address
    Compile,
    /// Print a self-verifying backup of the configured vault
    Backup,
    /// Rebuild a vault from a backup file and check it
    Restore { backup: PathBuf },
    /// Build an unsigned spend PSBT
    Build {
        to: String,
        utxos: Vec<Utxo>,
        path: SpendPath,
        priority: FeePriority,
        heir: Option<String>,
    },
    /// Build an unsigned check-in PSBT back to the vault
    Checkin {
        utxos: Vec<Utxo>,
        priority: FeePriority,
    },
    /// Report on a PSBT and whether it spends this vault
    Validate { psbt: String },
    /// Assemble witnesses and extract the signed transaction
    Finalize { psbt: String, path: SpendPath },
    /// Timelock status and check-in advice
    Status {
        height: u32,
        median_time_past: u32,
        utxo_height: u32,
    },
    /// Classify how a transaction spent a vault UTXO
    Analyze {
        tx_hex: String,
        outpoint: OutPoint,
        spend_height: u32,
        utxo_height: u32,
    },
}

/// Parse `txid:vout:sats[:height]`.
pub fn parse_utxo(s: &str) -> Result<Utxo> {
    let parts: Vec<&str> = s.split(':').collect();
    anyhow::ensure!(
        parts.len() == 3 || parts.len() == 4,
        "UTXO '{}' must be txid:vout:sats[:height]",
        s
    );
    let outpoint = OutPoint::from_str(&format!("{}:{}", parts[0], parts[1]))
        .with_context(|| format!("Invalid outpoint in '{}'", s))?;
    let sats: u64 = parts[2]
        .parse()
        .with_context(|| format!("Invalid amount in '{}'", s))?;
    let height = match parts.get(3) {
        Some(h) => h
            .parse()
            .with_context(|| format!("Invalid height in '{}'", s))?,
        None => 0,
    };
    Ok(Utxo {
        outpoint,
        value: Amount::from_sat(sats),
        height,
    })
}

/// A PSBT argument is either the PSBT itself or `@path` to a file holding it.
fn read_psbt_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PSBT file: {}", path)),
        None => Ok(arg.to_string()),
    }
}

pub fn run(command: &Command, config: &CliConfig) -> Result<Value> {
    let vault = config
        .vault
        .into_vault()
        .context("Failed to build vault from config")?;
    let rates = config.fee_rates();

    match command {
        Command::Compile => Ok(serde_json::to_value(vault.summary())?),

        Command::Backup => {
            let backup = VaultBackup::create(&config.vault)?;
            Ok(serde_json::to_value(backup)?)
        }

        Command::Restore { backup } => restore(backup),

        Command::Build {
            to,
            utxos,
            path,
            priority,
            heir,
        } => {
            let intent = SpendIntent {
                destination: parse_address(to, vault.network)?,
                priority: *priority,
                path: *path,
                heir: heir.as_deref().map(parse_key).transpose()?,
            };
            let built = build_spend_psbt(&vault, utxos, &intent, &rates)?;
            Ok(psbt_json(&vault, &built))
        }

        Command::Checkin { utxos, priority } => {
            let built = build_checkin_psbt(&vault, utxos, *priority, &rates)?;
            Ok(psbt_json(&vault, &built))
        }

        Command::Validate { psbt } => {
            let report = validate_psbt(&read_psbt_arg(psbt)?, Some(&vault))?;
            Ok(serde_json::to_value(report)?)
        }

        Command::Finalize { psbt, path } => {
            let psbt = decode_psbt(&read_psbt_arg(psbt)?)?;
            let done = finalize_psbt(psbt, &vault, *path)?;
            Ok(json!({
                "txid": done.txid.to_string(),
                "hex": done.hex,
                "vsize": done.tx.vsize(),
            }))
        }

        Command::Status {
            height,
            median_time_past,
            utxo_height,
        } => {
            let chain = ChainPosition {
                height: *height,
                median_time_past: *median_time_past,
            };
            let status = evaluate_heartbeat(&vault, *utxo_height, &chain, &config.heartbeat)?;
            Ok(serde_json::to_value(status)?)
        }

        Command::Analyze {
            tx_hex,
            outpoint,
            spend_height,
            utxo_height,
        } => {
            let tx: Transaction = bitcoin::consensus::encode::deserialize_hex(tx_hex.trim())
                .context("Invalid transaction hex")?;
            let input = tx
                .input
                .iter()
                .find(|input| &input.previous_output == outpoint)
                .with_context(|| format!("Transaction does not spend {}", outpoint))?;
            let analysis = analyze_spend(&vault, &input.witness, *spend_height, *utxo_height)?;
            Ok(serde_json::to_value(analysis)?)
        }
    }
}

fn restore(path: &PathBuf) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read backup file: {}", path.display()))?;
    let backup: VaultBackup =
        serde_json::from_str(&contents).context("Failed to parse backup JSON")?;
    let vault = backup.reconstruct().context("Backup verification failed")?;
    Ok(serde_json::to_value(vault.summary())?)
}

fn psbt_json(vault: &Vault, built: &heirvault_inherit::psbt::VaultPsbt) -> Value {
    json!({
        "psbt": encode_psbt(&built.psbt),
        "vault": vault.address.to_string(),
        "path": built.plan.path.to_string(),
        "lock_time": built.plan.lock_time.to_consensus_u32(),
        "sequence": built.plan.sequence.to_consensus_u32(),
        "send_sat": built.send_amount.to_sat(),
        "fee_sat": built.fee.to_sat(),
        "fee_rate": built.fee_rate,
        "vsize": built.vsize,
    })
}
