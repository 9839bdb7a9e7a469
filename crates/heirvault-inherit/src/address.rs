//! P2WSH address derivation.

use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, Script, ScriptBuf};

use crate::error::{Result, VaultError};

/// Consensus limit on a witness script (MAX_SCRIPT_SIZE).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Derive the bech32 P2WSH address of a witness script.
///
/// `OP_0 <sha256(script)>`, encoded with the network's HRP (`bc`, `tb`,
/// `bcrt`). Changing either argument changes the address.
pub fn derive_address(script: &Script, network: Network) -> Result<Address> {
    if script.is_empty() {
        return Err(VaultError::AddressDerivationError(
            "empty witness script".into(),
        ));
    }
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(VaultError::AddressDerivationError(format!(
            "witness script is {} bytes, limit is {}",
            script.len(),
            MAX_SCRIPT_SIZE
        )));
    }

    let script_pubkey = ScriptBuf::new_p2wsh(&script.wscript_hash());
    let address = Address::from_script(&script_pubkey, network)
        .map_err(|e| VaultError::AddressDerivationError(e.to_string()))?;

    log::debug!("Derived {} address {}", network, address);
    Ok(address)
}

/// Map a network name onto a [`Network`].
pub fn parse_network(name: &str) -> Result<Network> {
    match name.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "bitcoin" | "main" => Ok(Network::Bitcoin),
        "testnet" | "testnet3" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(VaultError::UnsupportedNetwork(other.to_string())),
    }
}

/// Canonical name of a network, as accepted by [`parse_network`].
pub fn network_name(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "mainnet",
        Network::Testnet => "testnet",
        Network::Signet => "signet",
        Network::Regtest => "regtest",
        _ => "unknown",
    }
}

/// Whether `address` parses and belongs to `network`.
pub fn address_is_valid_for(address: &str, network: Network) -> bool {
    Address::<NetworkUnchecked>::from_str(address.trim())
        .map(|a| a.is_valid_for_network(network))
        .unwrap_or(false)
}

/// Parse an address string and require it to belong to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    Address::<NetworkUnchecked>::from_str(address.trim())
        .map_err(|e| VaultError::AddressDerivationError(format!("invalid address: {}", e)))?
        .require_network(network)
        .map_err(|e| VaultError::UnsupportedNetwork(e.to_string()))
}
