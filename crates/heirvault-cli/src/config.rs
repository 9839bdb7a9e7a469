//! CLI configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use heirvault_inherit::config::VaultConfig;
use heirvault_inherit::heartbeat::HeartbeatConfig;
use heirvault_inherit::{parse_network, FeeRates};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level CLI configuration
///
/// The vault's `network` is the only network setting. Unknown sections are
/// rejected so a misplaced key cannot be silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    #[serde(default)]
    pub logging: LoggingSection,

    /// Fee rates per priority tier (sat/vB)
    #[serde(default)]
    pub fees: FeeSection,

    /// Check-in thresholds for `status`
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// The vault: network, keys and profile parameters
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSection {
    #[serde(default = "default_fee_low")]
    pub low: f64,
    #[serde(default = "default_fee_medium")]
    pub medium: f64,
    #[serde(default = "default_fee_high")]
    pub high: f64,
}

impl Default for FeeSection {
    fn default() -> Self {
        Self {
            low: default_fee_low(),
            medium: default_fee_medium(),
            high: default_fee_high(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fee_low() -> f64 {
    2.0
}

fn default_fee_medium() -> f64 {
    10.0
}

fn default_fee_high() -> f64 {
    25.0
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `HEIRVAULT_NETWORK`
    /// - `HEIRVAULT_LOG_LEVEL`
    /// - `HEIRVAULT_FEE_LOW`
    /// - `HEIRVAULT_FEE_MEDIUM`
    /// - `HEIRVAULT_FEE_HIGH`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HEIRVAULT_NETWORK") {
            self.vault.network = v;
        }
        if let Ok(v) = std::env::var("HEIRVAULT_LOG_LEVEL") {
            self.logging.level = v;
        }
        for (var, slot) in [
            ("HEIRVAULT_FEE_LOW", &mut self.fees.low),
            ("HEIRVAULT_FEE_MEDIUM", &mut self.fees.medium),
            ("HEIRVAULT_FEE_HIGH", &mut self.fees.high),
        ] {
            if let Ok(v) = std::env::var(var) {
                if let Ok(rate) = v.parse::<f64>() {
                    *slot = rate;
                }
            }
        }
    }

    pub fn fee_rates(&self) -> FeeRates {
        FeeRates {
            low: self.fees.low,
            medium: self.fees.medium,
            high: self.fees.high,
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        parse_network(&self.vault.network)
            .with_context(|| format!("vault.network '{}'", self.vault.network))?;

        anyhow::ensure!(
            ["error", "warn", "info", "debug", "trace"]
                .contains(&self.logging.level.to_ascii_lowercase().as_str()),
            "logging.level must be one of error, warn, info, debug, trace"
        );

        for (name, rate) in [
            ("fees.low", self.fees.low),
            ("fees.medium", self.fees.medium),
            ("fees.high", self.fees.high),
        ] {
            anyhow::ensure!(
                rate.is_finite() && rate > 0.0 && rate <= heirvault_inherit::psbt::MAX_FEE_RATE,
                "{} must be in (0, {}] sat/vB",
                name,
                heirvault_inherit::psbt::MAX_FEE_RATE
            );
        }
        anyhow::ensure!(
            self.fees.low <= self.fees.medium && self.fees.medium <= self.fees.high,
            "fee rates must satisfy low <= medium <= high"
        );

        self.heartbeat
            .validate()
            .context("heartbeat thresholds are invalid")?;

        self.vault
            .to_profile()
            .context("vault section is invalid")?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const OWNER: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const HEIR: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn minimal_toml() -> String {
        format!(
            r#"
[vault]
profile = "timelock"
owner = "{OWNER}"
heir = "{HEIR}"
lock_height = 900000
"#
        )
    }

    fn full_toml() -> String {
        format!(
            r#"
[logging]
level = "debug"

[fees]
low = 1.0
medium = 5.0
high = 20.0

[heartbeat]
checkin_threshold = 0.6

[vault]
label = "family"
network = "testnet"
profile = "dead_man_switch"
owner = "{OWNER}"
heir = "{HEIR}"
inactivity_days = 180
"#
        )
    }

    fn load(toml: &str) -> CliConfig {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        CliConfig::from_file(file.path()).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = load(&minimal_toml());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.vault.network, "mainnet");
        assert_eq!(config.fees.medium, 10.0);
        assert_eq!(config.heartbeat.critical_threshold, 0.9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = load(&full_toml());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.vault.network, "testnet");
        assert_eq!(config.fee_rates().high, 20.0);
        assert_eq!(config.heartbeat.checkin_threshold, 0.6);
        assert_eq!(config.vault.label.as_deref(), Some("family"));
        assert!(config.validate().is_ok());

        let vault = config.vault.into_vault().unwrap();
        assert_eq!(vault.network, bitcoin::Network::Testnet);
        assert!(vault.address.to_string().starts_with("tb1q"));
    }

    #[test]
    fn test_vault_network_is_used() {
        let toml = minimal_toml().replace("[vault]\n", "[vault]\nnetwork = \"testnet\"\n");
        let config = load(&toml);
        assert!(config.validate().is_ok());
        let vault = config.vault.into_vault().unwrap();
        assert_eq!(vault.network, bitcoin::Network::Testnet);
        assert!(vault.address.to_string().starts_with("tb1q"));
    }

    #[test]
    fn test_stray_bitcoin_section_rejected() {
        let toml = format!("[bitcoin]\nnetwork = \"testnet\"\n{}", minimal_toml());
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        assert!(CliConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = load(&minimal_toml());

        std::env::set_var("HEIRVAULT_NETWORK", "regtest");
        std::env::set_var("HEIRVAULT_LOG_LEVEL", "trace");
        std::env::set_var("HEIRVAULT_FEE_HIGH", "42.5");

        config.apply_env_overrides();

        assert_eq!(config.vault.network, "regtest");
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.fees.high, 42.5);
        assert_eq!(config.fees.low, 2.0);

        std::env::remove_var("HEIRVAULT_NETWORK");
        std::env::remove_var("HEIRVAULT_LOG_LEVEL");
        std::env::remove_var("HEIRVAULT_FEE_HIGH");
    }

    #[test]
    fn test_missing_vault_section() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[logging]\nlevel = \"warn\"\n").unwrap();
        assert!(CliConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation_bad_network() {
        let mut config = load(&minimal_toml());
        config.vault.network = "litecoin".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_fee_rates() {
        let mut config = load(&minimal_toml());
        config.fees.low = 0.0;
        assert!(config.validate().is_err());

        let mut config = load(&minimal_toml());
        config.fees.high = 1_000.0;
        assert!(config.validate().is_err());

        let mut config = load(&minimal_toml());
        config.fees.low = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bad_vault() {
        let toml = minimal_toml().replace("lock_height = 900000", "lock_height = 0");
        assert!(load(&toml).validate().is_err());
    }

    #[test]
    fn test_validation_bad_heartbeat() {
        let mut config = load(&minimal_toml());
        config.heartbeat.critical_threshold = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = load(&full_toml());
        let serialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: CliConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.vault, config.vault);
        assert_eq!(reparsed.fees.high, config.fees.high);
    }
}
