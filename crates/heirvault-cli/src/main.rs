//! HeirVault CLI: one-shot front end to the inheritance vault library
//!
//! Compiles the vault described in the config file, builds unsigned PSBTs
//! for external signers, and finalizes them once signed. Every command
//! prints a single JSON document on stdout.
//!
//! # Usage
//!
//! ```bash
//! heirvault --config vault.toml compile
//! heirvault --config vault.toml build --to tb1q... --utxo <txid>:0:100000
//! heirvault --config vault.toml finalize @signed.psbt --path recovery
//! ```

mod commands;
mod config;

use anyhow::{Context, Result};
use commands::{parse_utxo, Command};
use heirvault_inherit::{FeePriority, SpendPath};
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_CONFIG: &str = "heirvault.toml";

#[derive(Debug, PartialEq)]
enum Invocation {
    Help,
    Version,
    Run {
        config_path: PathBuf,
        command: Command,
    },
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (config_path, command) = match parse_args(&args)? {
        Invocation::Help => {
            print_help();
            return Ok(());
        }
        Invocation::Version => {
            println!("heirvault {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Invocation::Run {
            config_path,
            command,
        } => (config_path, command),
    };

    // Load config
    let mut cli_config = config::CliConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply env overrides
    cli_config.apply_env_overrides();

    // Validate
    cli_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &cli_config.logging.level);
    env_logger::init();

    log::debug!("Running {:?} on {}", command, cli_config.vault.network);
    let output = commands::run(&command, &cli_config)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Parse the arguments after the program name.
fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = PathBuf::from(path),
                    None => anyhow::bail!("--config requires a path argument"),
                }
            }
            "--help" | "-h" => return Ok(Invocation::Help),
            "--version" | "-V" => return Ok(Invocation::Version),
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let Some((name, options)) = rest.split_first() else {
        return Ok(Invocation::Help);
    };
    let command = parse_command(name, options)?;
    Ok(Invocation::Run {
        config_path,
        command,
    })
}

/// Command options: `--flag value` pairs plus positionals, in order.
struct Options {
    pairs: Vec<(String, String)>,
    positional: Vec<String>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut pairs = Vec::new();
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if let Some(flag) = arg.strip_prefix("--") {
                let value = iter
                    .next()
                    .with_context(|| format!("--{} requires a value", flag))?;
                pairs.push((flag.to_string(), value.clone()));
            } else {
                positional.push(arg.clone());
            }
        }
        Ok(Self { pairs, positional })
    }

    fn get(&self, flag: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, flag: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn require(&self, flag: &str) -> Result<&str> {
        self.get(flag)
            .with_context(|| format!("--{} is required", flag))
    }

    fn number(&self, flag: &str, default: u32) -> Result<u32> {
        match self.get(flag) {
            Some(v) => v
                .parse()
                .with_context(|| format!("--{} must be a number", flag)),
            None => Ok(default),
        }
    }

    fn priority(&self) -> Result<FeePriority> {
        match self.get("priority") {
            Some(v) => FeePriority::from_str(v).map_err(anyhow::Error::msg),
            None => Ok(FeePriority::default()),
        }
    }

    fn path(&self, default: SpendPath) -> Result<SpendPath> {
        match self.get("path") {
            Some(v) => Ok(SpendPath::from_str(v)?),
            None => Ok(default),
        }
    }

    fn utxos(&self) -> Result<Vec<heirvault_inherit::Utxo>> {
        let utxos = self
            .all("utxo")
            .into_iter()
            .map(parse_utxo)
            .collect::<Result<Vec<_>>>()?;
        anyhow::ensure!(!utxos.is_empty(), "at least one --utxo is required");
        Ok(utxos)
    }

    /// The PSBT from `--psbt` or the first positional.
    fn psbt(&self) -> Result<String> {
        self.get("psbt")
            .or(self.positional.first().map(String::as_str))
            .map(str::to_string)
            .context("a PSBT (base64, hex or @file) is required")
    }
}

fn parse_command(name: &str, args: &[String]) -> Result<Command> {
    let opts = Options::parse(args)?;
    let command = match name {
        "compile" => Command::Compile,
        "backup" => Command::Backup,
        "restore" => Command::Restore {
            backup: opts
                .positional
                .first()
                .map(PathBuf::from)
                .context("restore requires a backup file")?,
        },
        "build" => Command::Build {
            to: opts.require("to")?.to_string(),
            utxos: opts.utxos()?,
            path: opts.path(SpendPath::Primary)?,
            priority: opts.priority()?,
            heir: opts.get("heir").map(str::to_string),
        },
        "checkin" => Command::Checkin {
            utxos: opts.utxos()?,
            priority: opts.priority()?,
        },
        "validate" => Command::Validate { psbt: opts.psbt()? },
        "finalize" => Command::Finalize {
            psbt: opts.psbt()?,
            path: opts.path(SpendPath::Primary)?,
        },
        "status" => Command::Status {
            height: opts
                .require("height")?
                .parse()
                .context("--height must be a number")?,
            median_time_past: opts.number("mtp", 0)?,
            utxo_height: opts
                .require("utxo-height")?
                .parse()
                .context("--utxo-height must be a number")?,
        },
        "analyze" => Command::Analyze {
            tx_hex: opts.require("tx")?.to_string(),
            outpoint: opts
                .require("outpoint")?
                .parse()
                .context("--outpoint must be txid:vout")?,
            spend_height: opts.number("spend-height", 0)?,
            utxo_height: opts.number("utxo-height", 0)?,
        },
        other => anyhow::bail!("Unknown command: {}", other),
    };
    Ok(command)
}

fn print_help() {
    println!(
        r#"HeirVault: Bitcoin inheritance vaults on plain consensus rules

USAGE:
    heirvault [OPTIONS] <COMMAND> [ARGS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: heirvault.toml)
    -h, --help            Show this help message
    -V, --version         Show version

COMMANDS:
    compile                          Witness script, address and spend paths
    backup                           Self-verifying vault backup (JSON)
    restore <FILE>                   Rebuild and verify a vault from a backup
    build --to <ADDR> --utxo <U>...  Unsigned spend PSBT
          [--path primary|recovery] [--priority low|medium|high] [--heir <KEY>]
    checkin --utxo <U>...            Unsigned check-in PSBT back to the vault
          [--priority low|medium|high]
    validate <PSBT>                  Inspect a PSBT against the vault
    finalize <PSBT> [--path P]       Assemble witnesses, print the signed tx
    status --height <H> --utxo-height <H> [--mtp <T>]
                                     Timelock status and check-in advice
    analyze --tx <HEX> --outpoint <TXID:VOUT>
          [--spend-height <H>] [--utxo-height <H>]
                                     Which path a transaction spent

    <U> is txid:vout:sats[:height]. <PSBT> is base64, hex or @file.

ENVIRONMENT VARIABLES (override config file):
    HEIRVAULT_NETWORK       Bitcoin network (mainnet/testnet/signet/regtest)
    HEIRVAULT_LOG_LEVEL     Log level (error/warn/info/debug/trace)
    HEIRVAULT_FEE_LOW       Low-priority fee rate (sat/vB)
    HEIRVAULT_FEE_MEDIUM    Medium-priority fee rate (sat/vB)
    HEIRVAULT_FEE_HIGH      High-priority fee rate (sat/vB)
"#
    );
}
