//! Shared test utilities for heirvault-inherit tests.
//!
//! Provides deterministic keypair generation, vault fixtures and a minimal
//! BIP-143 signer standing in for the external wallet.

use bitcoin::hashes::Hash as _;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, Txid};

use crate::profile::VaultProfile;
use crate::psbt::{FeeRates, Utxo};
use crate::vault::Vault;

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
/// Different seed bytes produce different keys.
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// Standard test xpub string (BIP-32 test vector 1, chain m).
pub fn test_xpub_str() -> &'static str {
    "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
}

/// Owner = seed 1, heir = seed 2.
pub fn timelock_profile(lock_height: u32) -> VaultProfile {
    VaultProfile::Timelock {
        owner: test_keypair(1).1,
        heir: test_keypair(2).1,
        lock_height,
    }
}

/// Owner = seed 1, heir = seed 2.
pub fn dead_man_profile(inactivity_blocks: u32) -> VaultProfile {
    VaultProfile::DeadManSwitch {
        owner: test_keypair(1).1,
        heir: test_keypair(2).1,
        inactivity_blocks,
    }
}

/// Owner = seed 1, heirs = seeds 2 and 3. Initial 2-of-3, decayed 1-of-2.
pub fn multisig_decay_profile(decay_height: u32) -> VaultProfile {
    VaultProfile::MultisigDecay {
        owner: test_keypair(1).1,
        heirs: vec![test_keypair(2).1, test_keypair(3).1],
        initial_threshold: 2,
        initial_total: 3,
        decayed_threshold: 1,
        decayed_total: 2,
        decay_height,
    }
}

/// Keys = seeds 1, 2, 3. Initial 2-of-3, decays to 1 key + timelock.
pub fn thresh_decay_profile(decay_height: u32) -> VaultProfile {
    VaultProfile::ThreshDecay {
        pubkeys: vec![test_keypair(1).1, test_keypair(2).1, test_keypair(3).1],
        initial_threshold: 2,
        decay_height,
    }
}

/// P2WPKH testnet address for seed 9, outside every fixture vault.
pub fn test_destination() -> Address {
    Address::p2wpkh(&CompressedPublicKey(test_keypair(9).1), Network::Testnet)
}

pub fn make_vault(profile: VaultProfile) -> Vault {
    Vault::new(profile, Network::Testnet).unwrap()
}

pub fn make_utxo(fill: u8, vout: u32, sats: u64, height: u32) -> Utxo {
    Utxo {
        outpoint: OutPoint {
            txid: Txid::from_byte_array([fill; 32]),
            vout,
        },
        value: Amount::from_sat(sats),
        height,
    }
}

pub fn test_fee_rates() -> FeeRates {
    FeeRates {
        low: 1.0,
        medium: 5.0,
        high: 20.0,
    }
}

/// Sign every input of a PSBT with `sk` (SIGHASH_ALL, BIP-143) and store the
/// result in `partial_sigs`, the way an external signer would.
pub fn sign_psbt(psbt: &mut Psbt, sk: &SecretKey) {
    let secp = Secp256k1::new();
    let pk = bitcoin::PublicKey::new(sk.public_key(&secp));

    for index in 0..psbt.inputs.len() {
        let script = psbt.inputs[index].witness_script.clone().unwrap();
        let value = psbt.inputs[index].witness_utxo.as_ref().unwrap().value;

        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .p2wsh_signature_hash(index, &script, value, EcdsaSighashType::All)
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = secp.sign_ecdsa(&msg, sk);

        psbt.inputs[index].partial_sigs.insert(
            pk,
            bitcoin::ecdsa::Signature {
                signature,
                sighash_type: EcdsaSighashType::All,
            },
        );
    }
}
