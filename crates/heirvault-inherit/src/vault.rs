//! A compiled vault: profile, witness script and address bundled together.

use bitcoin::{Address, Network, ScriptBuf, TxOut};
use serde::Serialize;

use crate::address::{derive_address, network_name};
use crate::error::Result;
use crate::profile::{SpendPath, SpendPlan, VaultProfile};
use crate::script::{compile, SpendPathInfo, WitnessScript};

/// A vault ready to receive funds.
#[derive(Debug, Clone)]
pub struct Vault {
    pub profile: VaultProfile,
    pub witness_script: WitnessScript,
    pub address: Address,
    pub network: Network,
}

/// Serializable view of a vault for export and display.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSummary {
    pub profile: String,
    pub network: String,
    pub address: String,
    pub script_hex: String,
    pub script_asm: String,
    pub spend_paths: Vec<SpendPathInfo>,
}

impl Vault {
    /// Compile `profile` and derive its address on `network`.
    pub fn new(profile: VaultProfile, network: Network) -> Result<Self> {
        let witness_script = compile(&profile)?;
        let address = derive_address(&witness_script.script, network)?;

        log::info!("Created {} vault at {}", profile.kind(), address);

        Ok(Self {
            profile,
            witness_script,
            address,
            network,
        })
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.witness_script.script
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn spend_plan(&self, path: SpendPath) -> Result<SpendPlan> {
        self.profile.spend_plan(path)
    }

    /// The output a vault UTXO of `value` carries, as signers expect it in
    /// `witness_utxo`.
    pub fn txout(&self, value: bitcoin::Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: self.script_pubkey(),
        }
    }

    pub fn summary(&self) -> VaultSummary {
        VaultSummary {
            profile: self.profile.kind().to_string(),
            network: network_name(self.network).to_string(),
            address: self.address.to_string(),
            script_hex: self.witness_script.to_hex(),
            script_asm: self.witness_script.to_asm(),
            spend_paths: self.witness_script.redeem_info.clone(),
        }
    }
}
