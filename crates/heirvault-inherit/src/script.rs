//! Witness script compilation
//!
//! Every profile compiles to a single P2WSH witness script. The encodings are
//! fixed byte for byte:
//!
//! ```text
//! Timelock:       IF <owner> CHECKSIG ELSE <lock> CLTV DROP <heir> CHECKSIG ENDIF
//! DeadManSwitch:  IF <owner> CHECKSIG ELSE <csv> CSV DROP <heir> CHECKSIG ENDIF
//! MultisigDecay:  IF <k> <keys..> <n> CHECKMULTISIG
//!                 ELSE <decay> CLTV DROP <k'> <heirs..> <m> CHECKMULTISIG ENDIF
//! ThreshDecay:    <k1> CHECKSIG (SWAP <ki> CHECKSIG ADD)*
//!                 SWAP IF 0 ELSE <h> CLTV 0NOTEQUAL ENDIF ADD <t> EQUAL
//! ```
//!
//! The ThreshDecay form is the miniscript
//! `thresh(t,pk(k1),s:pk(k2),...,sln:after(h))`, see [`thresh_descriptor`].

use std::str::FromStr;

use bitcoin::opcodes::all::{
    OP_0NOTEQUAL, OP_ADD, OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_CSV, OP_DROP, OP_ELSE,
    OP_ENDIF, OP_EQUAL, OP_IF, OP_SWAP,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;
use miniscript::{Descriptor, Miniscript, Segwitv0};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::keys::sort_bip67;
use crate::profile::{
    approx_duration, cltv_lock_time, csv_sequence, SpendPath, SpendPlan, VaultProfile,
    WitnessShape, LOCKTIME_THRESHOLD,
};

/// Compiled witness script plus a human-readable description of each path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessScript {
    pub script: ScriptBuf,
    /// Documentation only. Never parsed back.
    pub redeem_info: Vec<SpendPathInfo>,
}

/// Description of one spending path, for display and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendPathInfo {
    pub path: SpendPath,
    pub name: String,
    pub description: String,
    /// Witness stack, bottom to top, excluding the script itself.
    pub witness_template: String,
    pub sequence: u32,
    pub lock_time: u32,
}

impl WitnessScript {
    pub fn to_hex(&self) -> String {
        hex::encode(self.script.as_bytes())
    }

    pub fn to_asm(&self) -> String {
        self.script.to_asm_string()
    }
}

/// Compile a profile into its witness script.
///
/// Deterministic: the same profile always yields the same bytes.
pub fn compile(profile: &VaultProfile) -> Result<WitnessScript> {
    profile.validate()?;

    let script = match profile {
        VaultProfile::Timelock {
            owner,
            heir,
            lock_height,
        } => {
            let lock = cltv_lock_time(*lock_height)?;
            Builder::new()
                .push_opcode(OP_IF)
                .push_key(&full_key(owner))
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ELSE)
                .push_int(i64::from(lock.to_consensus_u32()))
                .push_opcode(OP_CLTV)
                .push_opcode(OP_DROP)
                .push_key(&full_key(heir))
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ENDIF)
                .into_script()
        }
        VaultProfile::DeadManSwitch {
            owner,
            heir,
            inactivity_blocks,
        } => {
            let sequence = csv_sequence(*inactivity_blocks)?;
            Builder::new()
                .push_opcode(OP_IF)
                .push_key(&full_key(owner))
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ELSE)
                .push_int(i64::from(sequence.to_consensus_u32()))
                .push_opcode(OP_CSV)
                .push_opcode(OP_DROP)
                .push_key(&full_key(heir))
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ENDIF)
                .into_script()
        }
        VaultProfile::MultisigDecay {
            owner,
            heirs,
            initial_threshold,
            decayed_threshold,
            decay_height,
            ..
        } => {
            let mut initial = heirs.clone();
            initial.push(*owner);
            let lock = cltv_lock_time(*decay_height)?;

            let builder = Builder::new().push_opcode(OP_IF);
            let builder = push_multisig(builder, *initial_threshold, &sort_bip67(&initial));
            let builder = builder
                .push_opcode(OP_ELSE)
                .push_int(i64::from(lock.to_consensus_u32()))
                .push_opcode(OP_CLTV)
                .push_opcode(OP_DROP);
            push_multisig(builder, *decayed_threshold, &sort_bip67(heirs))
                .push_opcode(OP_ENDIF)
                .into_script()
        }
        VaultProfile::ThreshDecay {
            pubkeys,
            initial_threshold,
            decay_height,
        } => {
            let keys = sort_bip67(pubkeys);
            let lock = cltv_lock_time(*decay_height)?;

            let mut builder = Builder::new();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    builder = builder.push_opcode(OP_SWAP);
                }
                builder = builder.push_key(&full_key(key)).push_opcode(OP_CHECKSIG);
                if i > 0 {
                    builder = builder.push_opcode(OP_ADD);
                }
            }
            builder
                .push_opcode(OP_SWAP)
                .push_opcode(OP_IF)
                .push_int(0)
                .push_opcode(OP_ELSE)
                .push_int(i64::from(lock.to_consensus_u32()))
                .push_opcode(OP_CLTV)
                .push_opcode(OP_0NOTEQUAL)
                .push_opcode(OP_ENDIF)
                .push_opcode(OP_ADD)
                .push_int(*initial_threshold as i64)
                .push_opcode(OP_EQUAL)
                .into_script()
        }
    };

    let redeem_info = [SpendPath::Primary, SpendPath::Recovery]
        .into_iter()
        .map(|path| Ok(describe(profile, &profile.spend_plan(path)?)))
        .collect::<Result<Vec<_>>>()?;

    log::debug!(
        "Compiled {} vault script ({} bytes)",
        profile.kind(),
        script.len()
    );

    Ok(WitnessScript {
        script,
        redeem_info,
    })
}

/// Export a ThreshDecay vault as a `wsh(thresh(...))` descriptor.
///
/// The descriptor's witness script is identical to [`compile`]'s output, so
/// any miniscript-aware wallet can co-sign.
pub fn thresh_descriptor(profile: &VaultProfile) -> Result<Descriptor<bitcoin::PublicKey>> {
    let VaultProfile::ThreshDecay {
        pubkeys,
        initial_threshold,
        decay_height,
    } = profile
    else {
        return Err(VaultError::InvalidProfileParameters(format!(
            "{} vaults have no miniscript descriptor",
            profile.kind()
        )));
    };
    profile.validate()?;

    let mut terms: Vec<String> = sort_bip67(pubkeys)
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let wrapper = if i == 0 { "" } else { "s:" };
            format!("{}pk({})", wrapper, hex::encode(key.serialize()))
        })
        .collect();
    terms.push(format!("sln:after({})", decay_height));

    let policy = format!("thresh({},{})", initial_threshold, terms.join(","));
    let ms = Miniscript::<bitcoin::PublicKey, Segwitv0>::from_str(&policy)
        .map_err(|e| VaultError::InvalidProfileParameters(format!("miniscript: {}", e)))?;
    Descriptor::new_wsh(ms)
        .map_err(|e| VaultError::InvalidProfileParameters(format!("descriptor: {}", e)))
}

fn full_key(key: &PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey::new(*key)
}

fn push_multisig(builder: Builder, threshold: usize, keys: &[PublicKey]) -> Builder {
    let mut builder = builder.push_int(threshold as i64);
    for key in keys {
        builder = builder.push_key(&full_key(key));
    }
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
}

fn short_key(key: &PublicKey) -> String {
    hex::encode(&key.serialize()[..4])
}

fn lock_description(value: u32) -> String {
    if value >= LOCKTIME_THRESHOLD {
        format!("after UNIX time {}", value)
    } else {
        format!("from block {}", value)
    }
}

fn describe(profile: &VaultProfile, plan: &SpendPlan) -> SpendPathInfo {
    let primary = plan.path == SpendPath::Primary;
    let lock = plan.lock_time.to_consensus_u32();

    let (name, description) = match profile {
        VaultProfile::Timelock { .. } if primary => (
            "owner",
            "Owner signs alone, at any time".to_string(),
        ),
        VaultProfile::Timelock { .. } => ("heir", format!("Heir signs alone {}", lock_description(lock))),
        VaultProfile::DeadManSwitch { .. } if primary => (
            "owner",
            "Owner signs alone; every owner spend restarts the inactivity clock".to_string(),
        ),
        VaultProfile::DeadManSwitch {
            inactivity_blocks, ..
        } => (
            "heir",
            format!(
                "Heir signs alone after {} without an owner spend",
                approx_duration(*inactivity_blocks)
            ),
        ),
        VaultProfile::MultisigDecay {
            initial_threshold,
            initial_total,
            ..
        } if primary => (
            "initial quorum",
            format!(
                "{} of {} signatures from owner and heirs",
                initial_threshold, initial_total
            ),
        ),
        VaultProfile::MultisigDecay {
            decayed_threshold,
            decayed_total,
            ..
        } => (
            "decayed quorum",
            format!(
                "{} of {} heir signatures {}",
                decayed_threshold,
                decayed_total,
                lock_description(lock)
            ),
        ),
        VaultProfile::ThreshDecay {
            initial_threshold,
            pubkeys,
            ..
        } if primary => (
            "full threshold",
            format!("{} of {} key signatures", initial_threshold, pubkeys.len()),
        ),
        VaultProfile::ThreshDecay {
            initial_threshold,
            pubkeys,
            ..
        } => (
            "decayed threshold",
            format!(
                "{} of {} key signatures {}",
                initial_threshold - 1,
                pubkeys.len(),
                lock_description(lock)
            ),
        ),
    };

    SpendPathInfo {
        path: plan.path,
        name: name.to_string(),
        description,
        witness_template: witness_template(&plan.shape),
        sequence: plan.sequence.to_consensus_u32(),
        lock_time: lock,
    }
}

fn branch_flag(branch: bool) -> &'static str {
    if branch {
        "01"
    } else {
        "<>"
    }
}

fn witness_template(shape: &WitnessShape) -> String {
    match shape {
        WitnessShape::Checksig { key, branch } => {
            format!("<sig:{}> {}", short_key(key), branch_flag(*branch))
        }
        WitnessShape::Multisig {
            threshold,
            keys,
            branch,
        } => {
            let sigs: Vec<String> = (1..=*threshold).map(|i| format!("<sig_{}>", i)).collect();
            let signers: Vec<String> = keys.iter().map(short_key).collect();
            format!(
                "<> {} {} (any {} of {} in key order)",
                sigs.join(" "),
                branch_flag(*branch),
                threshold,
                signers.join(",")
            )
        }
        WitnessShape::Thresh {
            required,
            keys,
            timelock,
        } => {
            let slots: Vec<String> = keys
                .iter()
                .rev()
                .map(|k| format!("<sig:{}|<>>", short_key(k)))
                .collect();
            format!(
                "{} {} ({} signatures)",
                if *timelock { "<>" } else { "01" },
                slots.join(" "),
                required
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        dead_man_profile, multisig_decay_profile, test_keypair, thresh_decay_profile,
        timelock_profile,
    };
    use crate::address::derive_address;
    use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_2, OP_PUSHNUM_3};
    use bitcoin::Network;
    use bitcoin::script::Instruction;

    fn instructions(script: &ScriptBuf) -> Vec<Instruction<'_>> {
        script.instructions().map(|i| i.unwrap()).collect()
    }

    fn op(i: &Instruction<'_>) -> Option<bitcoin::opcodes::Opcode> {
        match i {
            Instruction::Op(o) => Some(*o),
            Instruction::PushBytes(_) => None,
        }
    }

    fn push(i: &Instruction<'_>) -> Vec<u8> {
        match i {
            Instruction::PushBytes(b) => b.as_bytes().to_vec(),
            Instruction::Op(o) => panic!("expected push, got {:?}", o),
        }
    }

    #[test]
    fn test_timelock_exact_bytes() {
        let owner = test_keypair(1).1.serialize();
        let heir = test_keypair(2).1.serialize();
        let ws = compile(&timelock_profile(900_000)).unwrap();

        // 900000 = 0x0dbba0, minimal little-endian push
        let mut expected = vec![0x63, 0x21];
        expected.extend_from_slice(&owner);
        expected.extend_from_slice(&[0xac, 0x67, 0x03, 0xa0, 0xbb, 0x0d, 0xb1, 0x75, 0x21]);
        expected.extend_from_slice(&heir);
        expected.extend_from_slice(&[0xac, 0x68]);

        assert_eq!(ws.script.as_bytes(), expected.as_slice());
    }

    #[test]
    fn test_timestamp_lock_encoding() {
        let ws = compile(&timelock_profile(1_893_456_000)).unwrap();
        let ins = instructions(&ws.script);
        // 1893456000 = 0x70dbd880
        assert_eq!(push(&ins[4]), vec![0x80, 0xd8, 0xdb, 0x70]);
        assert_eq!(op(&ins[5]), Some(OP_CLTV));
    }

    #[test]
    fn test_dead_man_switch_structure() {
        let ws = compile(&dead_man_profile(26_280)).unwrap();
        let ins = instructions(&ws.script);

        assert_eq!(op(&ins[0]), Some(OP_IF));
        assert_eq!(op(&ins[3]), Some(OP_ELSE));
        // 26280 = 0x66a8
        assert_eq!(push(&ins[4]), vec![0xa8, 0x66]);
        assert_eq!(op(&ins[5]), Some(OP_CSV));
        assert_eq!(op(&ins[6]), Some(OP_DROP));
        assert_eq!(op(&ins[9]), Some(OP_ENDIF));
    }

    #[test]
    fn test_small_csv_uses_pushnum() {
        let ws = compile(&dead_man_profile(16)).unwrap();
        let ins = instructions(&ws.script);
        assert_eq!(op(&ins[4]).map(|o| o.to_u8()), Some(0x60));
    }

    #[test]
    fn test_multisig_decay_structure() {
        let ws = compile(&multisig_decay_profile(900_000)).unwrap();
        let ins = instructions(&ws.script);

        let initial = sort_bip67(&[test_keypair(1).1, test_keypair(2).1, test_keypair(3).1]);
        let decayed = sort_bip67(&[test_keypair(2).1, test_keypair(3).1]);

        assert_eq!(op(&ins[0]), Some(OP_IF));
        assert_eq!(op(&ins[1]), Some(OP_PUSHNUM_2));
        for (i, key) in initial.iter().enumerate() {
            assert_eq!(push(&ins[2 + i]), key.serialize().to_vec());
        }
        assert_eq!(op(&ins[5]), Some(OP_PUSHNUM_3));
        assert_eq!(op(&ins[6]), Some(OP_CHECKMULTISIG));
        assert_eq!(op(&ins[7]), Some(OP_ELSE));
        assert_eq!(op(&ins[9]), Some(OP_CLTV));
        assert_eq!(op(&ins[10]), Some(OP_DROP));
        assert_eq!(op(&ins[11]), Some(OP_PUSHNUM_1));
        for (i, key) in decayed.iter().enumerate() {
            assert_eq!(push(&ins[12 + i]), key.serialize().to_vec());
        }
        assert_eq!(op(&ins[14]), Some(OP_PUSHNUM_2));
        assert_eq!(op(&ins[15]), Some(OP_CHECKMULTISIG));
        assert_eq!(op(&ins[16]), Some(OP_ENDIF));
        assert_eq!(ins.len(), 17);
    }

    #[test]
    fn test_multisig_key_order_independent() {
        let reordered = VaultProfile::MultisigDecay {
            owner: test_keypair(1).1,
            heirs: vec![test_keypair(3).1, test_keypair(2).1],
            initial_threshold: 2,
            initial_total: 3,
            decayed_threshold: 1,
            decayed_total: 2,
            decay_height: 900_000,
        };
        assert_eq!(
            compile(&reordered).unwrap().script,
            compile(&multisig_decay_profile(900_000)).unwrap().script
        );
    }

    #[test]
    fn test_thresh_decay_structure() {
        let ws = compile(&thresh_decay_profile(900_000)).unwrap();
        let ins = instructions(&ws.script);
        let keys = sort_bip67(&[test_keypair(1).1, test_keypair(2).1, test_keypair(3).1]);

        assert_eq!(push(&ins[0]), keys[0].serialize().to_vec());
        assert_eq!(op(&ins[1]), Some(OP_CHECKSIG));
        assert_eq!(op(&ins[2]), Some(OP_SWAP));
        assert_eq!(push(&ins[3]), keys[1].serialize().to_vec());
        assert_eq!(op(&ins[4]), Some(OP_CHECKSIG));
        assert_eq!(op(&ins[5]), Some(OP_ADD));
        assert_eq!(op(&ins[6]), Some(OP_SWAP));
        assert_eq!(push(&ins[7]), keys[2].serialize().to_vec());
        assert_eq!(op(&ins[10]), Some(OP_SWAP));
        assert_eq!(op(&ins[11]), Some(OP_IF));
        assert_eq!(push(&ins[12]), Vec::<u8>::new());
        assert_eq!(op(&ins[13]), Some(OP_ELSE));
        assert_eq!(op(&ins[15]), Some(OP_CLTV));
        assert_eq!(op(&ins[16]), Some(OP_0NOTEQUAL));
        assert_eq!(op(&ins[17]), Some(OP_ENDIF));
        assert_eq!(op(&ins[18]), Some(OP_ADD));
        assert_eq!(op(&ins[19]), Some(OP_PUSHNUM_2));
        assert_eq!(op(&ins[20]), Some(OP_EQUAL));
    }

    #[test]
    fn test_thresh_matches_miniscript_encoding() {
        let profile = thresh_decay_profile(900_000);
        let ws = compile(&profile).unwrap();
        let descriptor = thresh_descriptor(&profile).unwrap();
        assert_eq!(descriptor.explicit_script().unwrap(), ws.script);
        assert!(descriptor.to_string().starts_with("wsh(thresh(2,pk("));
    }

    #[test]
    fn test_descriptor_only_for_thresh() {
        assert!(matches!(
            thresh_descriptor(&timelock_profile(900_000)),
            Err(VaultError::InvalidProfileParameters(_))
        ));
    }

    #[test]
    fn test_compile_is_deterministic() {
        for profile in [
            timelock_profile(900_000),
            dead_man_profile(4_320),
            multisig_decay_profile(900_000),
            thresh_decay_profile(900_000),
        ] {
            assert_eq!(compile(&profile).unwrap(), compile(&profile).unwrap());
        }
    }

    /// `variant` must compile to a different script and testnet address.
    fn assert_changes(base: &VaultProfile, variant: VaultProfile) {
        let a = compile(base).unwrap().script;
        let b = compile(&variant).unwrap().script;
        assert_ne!(a, b, "{:?}", variant);
        assert_ne!(
            derive_address(&a, Network::Testnet).unwrap(),
            derive_address(&b, Network::Testnet).unwrap()
        );
    }

    #[test]
    fn test_any_parameter_changes_script() {
        let base = timelock_profile(900_000);
        assert_changes(&base, timelock_profile(900_001));
        assert_changes(
            &base,
            VaultProfile::Timelock {
                owner: test_keypair(2).1,
                heir: test_keypair(1).1,
                lock_height: 900_000,
            },
        );
        assert_changes(
            &base,
            VaultProfile::Timelock {
                owner: test_keypair(1).1,
                heir: test_keypair(9).1,
                lock_height: 900_000,
            },
        );

        assert_changes(&dead_man_profile(4_320), dead_man_profile(4_321));
        assert_changes(
            &dead_man_profile(4_320),
            VaultProfile::DeadManSwitch {
                owner: test_keypair(1).1,
                heir: test_keypair(9).1,
                inactivity_blocks: 4_320,
            },
        );
    }

    #[test]
    fn test_multisig_parameters_change_script() {
        let base = multisig_decay_profile(900_000);
        let with = |f: &dyn Fn(&mut VaultProfile)| {
            let mut profile = base.clone();
            f(&mut profile);
            profile
        };

        assert_changes(&base, multisig_decay_profile(900_001));
        assert_changes(
            &base,
            with(&|p| {
                if let VaultProfile::MultisigDecay {
                    initial_threshold, ..
                } = p
                {
                    *initial_threshold = 3;
                }
            }),
        );
        assert_changes(
            &base,
            with(&|p| {
                if let VaultProfile::MultisigDecay {
                    decayed_threshold, ..
                } = p
                {
                    *decayed_threshold = 2;
                }
            }),
        );
        assert_changes(
            &base,
            with(&|p| {
                if let VaultProfile::MultisigDecay { heirs, .. } = p {
                    heirs[1] = test_keypair(9).1;
                }
            }),
        );
        assert_changes(
            &base,
            with(&|p| {
                if let VaultProfile::MultisigDecay { owner, .. } = p {
                    *owner = test_keypair(9).1;
                }
            }),
        );
    }

    #[test]
    fn test_thresh_parameters_change_script() {
        let base = thresh_decay_profile(900_000);

        assert_changes(&base, thresh_decay_profile(900_001));
        assert_changes(
            &base,
            VaultProfile::ThreshDecay {
                pubkeys: vec![test_keypair(1).1, test_keypair(2).1, test_keypair(3).1],
                initial_threshold: 3,
                decay_height: 900_000,
            },
        );
        assert_changes(
            &base,
            VaultProfile::ThreshDecay {
                pubkeys: vec![test_keypair(1).1, test_keypair(2).1, test_keypair(9).1],
                initial_threshold: 2,
                decay_height: 900_000,
            },
        );
    }

    #[test]
    fn test_redeem_info() {
        let ws = compile(&timelock_profile(900_000)).unwrap();
        assert_eq!(ws.redeem_info.len(), 2);

        let heir = &ws.redeem_info[1];
        assert_eq!(heir.path, SpendPath::Recovery);
        assert_eq!(heir.lock_time, 900_000);
        assert_eq!(heir.sequence, 0xFFFF_FFFE);
        assert!(heir.description.contains("900000"));
        assert!(heir.witness_template.ends_with("<>"));

        let owner = &ws.redeem_info[0];
        assert!(owner.witness_template.ends_with("01"));
    }

    #[test]
    fn test_redeem_info_dead_man_sequences() {
        let ws = compile(&dead_man_profile(4_320)).unwrap();
        assert_eq!(ws.redeem_info[0].sequence, 0xFFFF_FFFF);
        assert_eq!(ws.redeem_info[1].sequence, 4_320);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        assert!(matches!(
            compile(&timelock_profile(0)),
            Err(VaultError::InvalidProfileParameters(_))
        ));
    }

    #[test]
    fn test_asm_and_hex() {
        let ws = compile(&timelock_profile(900_000)).unwrap();
        assert!(ws.to_asm().starts_with("OP_IF"));
        assert_eq!(ws.to_hex().len(), ws.script.len() * 2);
    }
}
