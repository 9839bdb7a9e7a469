//! Key normalization
//!
//! Vault participants hand over either a raw compressed public key (hex) or an
//! extended public key exported by their wallet. Only the key embedded at the
//! given node is used; no derivation path is walked.
//!
//! Accepted extended prefixes: `xpub`, `tpub`, `upub`, `vpub`, `ypub`, `zpub`
//! (and the capitalised SLIP-132 multisig forms). The version bytes are not
//! interpreted beyond the prefix, so the same node exported under different
//! script-type prefixes normalizes to the same key.

use bitcoin::base58;
use bitcoin::secp256k1::PublicKey;

use crate::error::{Result, VaultError};

/// Length of a serialized BIP-32 extended key.
const EXTENDED_KEY_LEN: usize = 78;

/// Offset of the public key inside a serialized extended key
/// (version 4 + depth 1 + parent fingerprint 4 + child number 4 + chain code 32).
const EXTENDED_KEY_PUBKEY_OFFSET: usize = 45;

/// Length of a compressed public key in hex.
const COMPRESSED_HEX_LEN: usize = 66;

/// Normalize a hex or extended public key to its canonical lowercase hex form.
pub fn normalize_key(input: &str) -> Result<String> {
    let key = parse_key(input)?;
    Ok(hex::encode(key.serialize()))
}

/// Parse a hex or extended public key into a compressed secp256k1 point.
pub fn parse_key(input: &str) -> Result<PublicKey> {
    let trimmed = input.trim();

    let bytes = if is_compressed_hex(trimmed) {
        hex::decode(trimmed.to_ascii_lowercase())
            .map_err(|e| VaultError::InvalidKeyFormat(format!("bad hex: {}", e)))?
    } else if has_extended_prefix(trimmed) {
        extract_extended_pubkey(trimmed)?
    } else {
        return Err(VaultError::InvalidKeyFormat(
            "expected 66 hex characters or an extended public key".into(),
        ));
    };

    if bytes.len() != 33 || !matches!(bytes[0], 0x02 | 0x03) {
        return Err(VaultError::InvalidKeyFormat(
            "key must be 33 bytes starting with 0x02 or 0x03".into(),
        ));
    }

    PublicKey::from_slice(&bytes)
        .map_err(|e| VaultError::InvalidKeyFormat(format!("not a curve point: {}", e)))
}

/// Parse a list of keys, failing on the first malformed entry.
pub fn parse_keys<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<PublicKey>> {
    inputs.iter().map(|k| parse_key(k.as_ref())).collect()
}

/// Sort keys by their serialized form (BIP-67).
pub fn sort_bip67(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.serialize());
    sorted
}

fn is_compressed_hex(s: &str) -> bool {
    s.len() == COMPRESSED_HEX_LEN
        && (s.starts_with("02") || s.starts_with("03"))
        && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn has_extended_prefix(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if "xtuvyzXTUVYZ".contains(c) => s.get(1..4) == Some("pub"),
        _ => false,
    }
}

fn extract_extended_pubkey(s: &str) -> Result<Vec<u8>> {
    let data = base58::decode_check(s)
        .map_err(|e| VaultError::InvalidKeyFormat(format!("base58check decode failed: {}", e)))?;

    if data.len() != EXTENDED_KEY_LEN {
        return Err(VaultError::InvalidKeyFormat(format!(
            "extended key must be {} bytes, got {}",
            EXTENDED_KEY_LEN,
            data.len()
        )));
    }

    Ok(data[EXTENDED_KEY_PUBKEY_OFFSET..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_keypair, test_xpub_str};
    use bitcoin::bip32::Xpub;
    use bitcoin::NetworkKind;
    use std::str::FromStr;

    /// Public key of BIP-32 test vector 1, chain m.
    const TEST_XPUB_KEY: &str =
        "0339a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2";

    fn reencode_with_version(xpub: &Xpub, version: [u8; 4]) -> String {
        let mut data = xpub.encode();
        data[..4].copy_from_slice(&version);
        base58::encode_check(&data)
    }

    #[test]
    fn test_hex_key_lowercased() {
        let (_, pk) = test_keypair(1);
        let upper = hex::encode(pk.serialize()).to_uppercase();
        assert_eq!(normalize_key(&upper).unwrap(), hex::encode(pk.serialize()));
    }

    #[test]
    fn test_xpub_extracts_node_key() {
        assert_eq!(normalize_key(test_xpub_str()).unwrap(), TEST_XPUB_KEY);
    }

    #[test]
    fn test_tpub_same_node_same_key() {
        let mut xpub = Xpub::from_str(test_xpub_str()).unwrap();
        xpub.network = NetworkKind::Test;
        let tpub = xpub.to_string();
        assert!(tpub.starts_with("tpub"));
        assert_eq!(normalize_key(&tpub).unwrap(), TEST_XPUB_KEY);
    }

    #[test]
    fn test_slip132_prefixes() {
        let xpub = Xpub::from_str(test_xpub_str()).unwrap();

        let zpub = reencode_with_version(&xpub, [0x04, 0xb2, 0x47, 0x46]);
        assert!(zpub.starts_with("zpub"));
        assert_eq!(normalize_key(&zpub).unwrap(), TEST_XPUB_KEY);

        let vpub = reencode_with_version(&xpub, [0x04, 0x5f, 0x1c, 0xf6]);
        assert!(vpub.starts_with("vpub"));
        assert_eq!(normalize_key(&vpub).unwrap(), TEST_XPUB_KEY);
    }

    #[test]
    fn test_normalize_idempotent() {
        let (_, pk) = test_keypair(7);
        for input in [hex::encode(pk.serialize()), test_xpub_str().to_string()] {
            let once = normalize_key(&input).unwrap();
            assert_eq!(normalize_key(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let (_, pk) = test_keypair(1);
        let good = hex::encode(pk.serialize());

        // Uncompressed prefix
        let bad_prefix = format!("04{}", &good[2..]);
        // Too short
        let short = &good[..64];
        // Corrupted checksum
        let mut corrupted = test_xpub_str().to_string();
        corrupted.pop();
        corrupted.push('9');

        for input in [
            bad_prefix.as_str(),
            short,
            "",
            "not a key",
            corrupted.as_str(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi",
        ] {
            assert!(
                matches!(normalize_key(input), Err(VaultError::InvalidKeyFormat(_))),
                "should reject {:?}",
                input
            );
        }
    }

    #[test]
    fn test_rejects_off_curve_point() {
        // x exceeds the field prime
        let off_curve = format!("02{}", "ff".repeat(32));
        assert!(matches!(
            parse_key(&off_curve),
            Err(VaultError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_extended_key_wrong_length() {
        let xpub = Xpub::from_str(test_xpub_str()).unwrap();
        let truncated = base58::encode_check(&xpub.encode()[..77]);
        assert!(matches!(
            parse_key(&truncated),
            Err(VaultError::InvalidKeyFormat(_))
        ));
        assert!(matches!(
            extract_extended_pubkey(&truncated),
            Err(VaultError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_bip67_sort_is_bytewise() {
        let keys: Vec<PublicKey> = (1..=5).map(|i| test_keypair(i).1).collect();
        let sorted = sort_bip67(&keys);
        for pair in sorted.windows(2) {
            assert!(pair[0].serialize() < pair[1].serialize());
        }
        let mut reversed = keys.clone();
        reversed.reverse();
        assert_eq!(sort_bip67(&reversed), sorted);
    }
}
