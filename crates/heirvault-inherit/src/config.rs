//! External vault configuration.
//!
//! Keys are given as strings (hex or extended public keys) and durations in
//! the units a user thinks in. [`VaultConfig::into_vault`] normalizes the keys,
//! builds the [`VaultProfile`], compiles it and derives the address.
//!
//! ```toml
//! label = "family"
//! network = "testnet"
//! profile = "dead_man_switch"
//! owner = "xpub661My..."
//! heir = "02c6047f..."
//! inactivity_days = 180
//! ```

use serde::{Deserialize, Serialize};

use crate::address::parse_network;
use crate::error::{Result, VaultError};
use crate::keys::{parse_key, parse_keys};
use crate::profile::{days_to_blocks, VaultProfile};
use crate::vault::Vault;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(flatten)]
    pub profile: ProfileConfig,
}

/// Profile parameters as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum ProfileConfig {
    Timelock {
        owner: String,
        heir: String,
        lock_height: u32,
    },
    DeadManSwitch {
        owner: String,
        heir: String,
        /// 144 blocks per day. Exclusive with `inactivity_blocks`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inactivity_days: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inactivity_blocks: Option<u32>,
    },
    MultisigDecay {
        owner: String,
        heirs: Vec<String>,
        initial_threshold: usize,
        decayed_threshold: usize,
        decay_height: u32,
    },
    ThreshDecay {
        pubkeys: Vec<String>,
        initial_threshold: usize,
        decay_height: u32,
    },
}

fn default_network() -> String {
    "mainnet".to_string()
}

impl VaultConfig {
    /// Normalize keys and build the profile, without compiling.
    pub fn to_profile(&self) -> Result<VaultProfile> {
        let profile = match &self.profile {
            ProfileConfig::Timelock {
                owner,
                heir,
                lock_height,
            } => VaultProfile::Timelock {
                owner: parse_key(owner)?,
                heir: parse_key(heir)?,
                lock_height: *lock_height,
            },
            ProfileConfig::DeadManSwitch {
                owner,
                heir,
                inactivity_days,
                inactivity_blocks,
            } => {
                let blocks = match (inactivity_days, inactivity_blocks) {
                    (Some(days), None) => days_to_blocks(*days)?,
                    (None, Some(blocks)) => *blocks,
                    _ => {
                        return Err(VaultError::InvalidProfileParameters(
                            "set exactly one of inactivity_days and inactivity_blocks".into(),
                        ))
                    }
                };
                VaultProfile::DeadManSwitch {
                    owner: parse_key(owner)?,
                    heir: parse_key(heir)?,
                    inactivity_blocks: blocks,
                }
            }
            ProfileConfig::MultisigDecay {
                owner,
                heirs,
                initial_threshold,
                decayed_threshold,
                decay_height,
            } => VaultProfile::MultisigDecay {
                owner: parse_key(owner)?,
                heirs: parse_keys(heirs)?,
                initial_threshold: *initial_threshold,
                initial_total: heirs.len() + 1,
                decayed_threshold: *decayed_threshold,
                decayed_total: heirs.len(),
                decay_height: *decay_height,
            },
            ProfileConfig::ThreshDecay {
                pubkeys,
                initial_threshold,
                decay_height,
            } => VaultProfile::ThreshDecay {
                pubkeys: parse_keys(pubkeys)?,
                initial_threshold: *initial_threshold,
                decay_height: *decay_height,
            },
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Build the vault this config describes.
    pub fn into_vault(&self) -> Result<Vault> {
        let network = parse_network(&self.network)?;
        Vault::new(self.to_profile()?, network)
    }
}
