//! VaultBackup: a self-verifying record of a vault.
//!
//! Contains everything an heir needs to rebuild the witness script, find the
//! UTXO on-chain and build a claim transaction. [`VaultBackup::reconstruct`]
//! recompiles from the key material and refuses a backup whose recorded
//! script or address disagree with the result.

use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::script::{thresh_descriptor, SpendPathInfo};
use crate::vault::Vault;

/// Current backup format version.
pub const BACKUP_VERSION: u32 = 1;

/// Serializable vault backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultBackup {
    /// Format version (for future compatibility)
    pub version: u32,
    pub config: VaultConfig,
    /// Witness script (hex), for verification
    pub script_hex: String,
    /// P2WSH address, for verification
    pub vault_address: String,
    /// Miniscript descriptor, for threshold-decay vaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spend_paths: Vec<SpendPathInfo>,
}

impl VaultBackup {
    /// Build the vault described by `config` and record the result.
    pub fn create(config: &VaultConfig) -> Result<Self> {
        let vault = config.into_vault()?;
        let descriptor = match thresh_descriptor(&vault.profile) {
            Ok(d) => Some(d.to_string()),
            Err(_) => None,
        };

        Ok(Self {
            version: BACKUP_VERSION,
            config: config.clone(),
            script_hex: vault.witness_script.to_hex(),
            vault_address: vault.address.to_string(),
            descriptor,
            spend_paths: vault.witness_script.redeem_info.clone(),
        })
    }

    /// Rebuild the vault and verify it matches the recorded script and address.
    pub fn reconstruct(&self) -> Result<Vault> {
        if self.version == 0 || self.version > BACKUP_VERSION {
            return Err(VaultError::Backup(format!(
                "unsupported backup version {}",
                self.version
            )));
        }

        let vault = self.config.into_vault()?;

        if !vault
            .witness_script
            .to_hex()
            .eq_ignore_ascii_case(self.script_hex.trim())
        {
            return Err(VaultError::Backup(
                "witness script does not match the key material".into(),
            ));
        }
        if vault.address.to_string() != self.vault_address.trim() {
            return Err(VaultError::Backup(format!(
                "address mismatch: backup has {}, keys give {}",
                self.vault_address, vault.address
            )));
        }

        log::debug!("Backup verified for {}", vault.address);
        Ok(vault)
    }
}
