//! Vault profiles and spend plans
//!
//! A [`VaultProfile`] fixes every participant key and time parameter of a
//! vault. Each profile has exactly two spending paths:
//!
//! | Profile         | Primary                         | Recovery                               |
//! |-----------------|---------------------------------|----------------------------------------|
//! | Timelock        | owner, any time                 | heir, after absolute lock (CLTV)       |
//! | DeadManSwitch   | owner, nSequence = 0xFFFFFFFF   | heir, after relative lock (CSV)        |
//! | MultisigDecay   | k-of-n over owner + heirs       | k'-of-m over heirs, after CLTV         |
//! | ThreshDecay     | t signatures                    | t-1 signatures + timelock term         |
//!
//! [`VaultProfile::spend_plan`] turns a path into typed requirements
//! (nLockTime, nSequence, witness shape). Script compilation, PSBT building
//! and finalization all derive from these plans.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Sequence;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::keys::sort_bip67;

/// Maximum number of keys OP_CHECKMULTISIG accepts.
pub const MAX_MULTISIG_KEYS: usize = 20;

/// Upper bound on keys in a threshold-decay vault.
pub const MAX_THRESH_KEYS: usize = 20;

/// nLockTime values at or above this are UNIX timestamps (BIP-65).
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// ~144 blocks per day.
pub const BLOCKS_PER_DAY: u32 = 144;

/// Inheritance profile of a vault.
///
/// Immutable once compiled: changing any field yields a different script and
/// therefore a different address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum VaultProfile {
    /// Owner spends any time; heir spends once `nLockTime >= lock_height`.
    Timelock {
        owner: PublicKey,
        heir: PublicKey,
        lock_height: u32,
    },
    /// Owner spends any time; heir spends `inactivity_blocks` after the UTXO
    /// confirmed. Every owner spend resets the clock.
    DeadManSwitch {
        owner: PublicKey,
        heir: PublicKey,
        inactivity_blocks: u32,
    },
    /// k-of-n multisig over owner and heirs, decaying to k'-of-m over heirs
    /// only once `decay_height` is reached.
    MultisigDecay {
        owner: PublicKey,
        heirs: Vec<PublicKey>,
        initial_threshold: usize,
        initial_total: usize,
        decayed_threshold: usize,
        decayed_total: usize,
        decay_height: u32,
    },
    /// `thresh(t, pk(k1), s:pk(k2), ..., sln:after(decay_height))`.
    ThreshDecay {
        pubkeys: Vec<PublicKey>,
        initial_threshold: usize,
        decay_height: u32,
    },
}

/// Which branch of a vault script a transaction spends through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendPath {
    /// Owner / full-quorum branch.
    Primary,
    /// Heir / decayed branch, gated by a timelock.
    Recovery,
}

impl fmt::Display for SpendPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpendPath::Primary => write!(f, "primary"),
            SpendPath::Recovery => write!(f, "recovery"),
        }
    }
}

impl FromStr for SpendPath {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" | "owner" => Ok(SpendPath::Primary),
            "recovery" | "heir" | "decayed" => Ok(SpendPath::Recovery),
            other => Err(VaultError::SpendPathMismatch(format!(
                "unknown spend path '{}'",
                other
            ))),
        }
    }
}

/// Witness stack layout a spend path requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WitnessShape {
    /// `<sig> <branch>` for an IF/ELSE branch ending in OP_CHECKSIG.
    Checksig { key: PublicKey, branch: bool },
    /// `<> <sig_1> .. <sig_k> <branch>` for an IF/ELSE branch ending in
    /// OP_CHECKMULTISIG. `keys` are BIP-67 sorted.
    Multisig {
        threshold: usize,
        keys: Vec<PublicKey>,
        branch: bool,
    },
    /// One slot per key (signature or empty), plus the timelock selector.
    /// `keys` are BIP-67 sorted.
    Thresh {
        required: usize,
        keys: Vec<PublicKey>,
        timelock: bool,
    },
}

impl WitnessShape {
    /// Keys allowed to sign on this path.
    pub fn signers(&self) -> &[PublicKey] {
        match self {
            WitnessShape::Checksig { key, .. } => std::slice::from_ref(key),
            WitnessShape::Multisig { keys, .. } | WitnessShape::Thresh { keys, .. } => keys,
        }
    }

    /// Exact number of signatures the witness must carry.
    pub fn required_signatures(&self) -> usize {
        match self {
            WitnessShape::Checksig { .. } => 1,
            WitnessShape::Multisig { threshold, .. } => *threshold,
            WitnessShape::Thresh { required, .. } => *required,
        }
    }
}

/// Typed requirements of one spend path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPlan {
    pub path: SpendPath,
    /// Transaction nLockTime.
    pub lock_time: LockTime,
    /// nSequence of every vault input.
    pub sequence: Sequence,
    pub shape: WitnessShape,
}

/// Time gate of a vault's recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryLock {
    /// BIP-65 absolute lock (height or timestamp).
    Absolute(LockTime),
    /// BIP-68 relative lock, counted from the UTXO's confirmation.
    Relative(Sequence),
}

impl VaultProfile {
    /// Dead man's switch with the inactivity period given in days.
    pub fn dead_man_switch_days(owner: PublicKey, heir: PublicKey, days: u32) -> Result<Self> {
        let profile = VaultProfile::DeadManSwitch {
            owner,
            heir,
            inactivity_blocks: days_to_blocks(days)?,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Short profile name, as used in configs and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultProfile::Timelock { .. } => "timelock",
            VaultProfile::DeadManSwitch { .. } => "dead_man_switch",
            VaultProfile::MultisigDecay { .. } => "multisig_decay",
            VaultProfile::ThreshDecay { .. } => "thresh_decay",
        }
    }

    /// Every participant key, in declaration order.
    pub fn keys(&self) -> Vec<PublicKey> {
        match self {
            VaultProfile::Timelock { owner, heir, .. }
            | VaultProfile::DeadManSwitch { owner, heir, .. } => vec![*owner, *heir],
            VaultProfile::MultisigDecay { owner, heirs, .. } => {
                std::iter::once(*owner).chain(heirs.iter().copied()).collect()
            }
            VaultProfile::ThreshDecay { pubkeys, .. } => pubkeys.clone(),
        }
    }

    /// Reject any parameter set that would produce an ambiguous or
    /// unspendable script.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for key in self.keys() {
            if !seen.insert(key.serialize()) {
                return Err(invalid("duplicate key in profile"));
            }
        }

        match self {
            VaultProfile::Timelock { lock_height, .. } => {
                cltv_lock_time(*lock_height)?;
            }
            VaultProfile::DeadManSwitch {
                inactivity_blocks, ..
            } => {
                csv_sequence(*inactivity_blocks)?;
            }
            VaultProfile::MultisigDecay {
                heirs,
                initial_threshold,
                initial_total,
                decayed_threshold,
                decayed_total,
                decay_height,
                ..
            } => {
                if heirs.is_empty() {
                    return Err(invalid("multisig decay needs at least one heir"));
                }
                if *initial_total != heirs.len() + 1 {
                    return Err(invalid(format!(
                        "initial total {} does not match owner + {} heirs",
                        initial_total,
                        heirs.len()
                    )));
                }
                if *decayed_total != heirs.len() {
                    return Err(invalid(format!(
                        "decayed total {} does not match {} heirs",
                        decayed_total,
                        heirs.len()
                    )));
                }
                if *initial_total > MAX_MULTISIG_KEYS {
                    return Err(invalid(format!(
                        "{} keys exceed the OP_CHECKMULTISIG limit of {}",
                        initial_total, MAX_MULTISIG_KEYS
                    )));
                }
                check_threshold(*initial_threshold, *initial_total)?;
                check_threshold(*decayed_threshold, *decayed_total)?;
                cltv_lock_time(*decay_height)?;
            }
            VaultProfile::ThreshDecay {
                pubkeys,
                initial_threshold,
                decay_height,
            } => {
                if pubkeys.is_empty() {
                    return Err(invalid("threshold decay needs at least one key"));
                }
                if pubkeys.len() > MAX_THRESH_KEYS {
                    return Err(invalid(format!(
                        "{} keys exceed the limit of {}",
                        pubkeys.len(),
                        MAX_THRESH_KEYS
                    )));
                }
                check_threshold(*initial_threshold, pubkeys.len())?;
                // With t = 1 the decayed path needs no signature at all.
                if *initial_threshold < 2 {
                    return Err(invalid(
                        "threshold decay needs an initial threshold of at least 2",
                    ));
                }
                cltv_lock_time(*decay_height)?;
            }
        }
        Ok(())
    }

    /// The time gate of the recovery path.
    pub fn recovery_lock(&self) -> Result<RecoveryLock> {
        match self {
            VaultProfile::Timelock { lock_height, .. } => {
                Ok(RecoveryLock::Absolute(cltv_lock_time(*lock_height)?))
            }
            VaultProfile::DeadManSwitch {
                inactivity_blocks, ..
            } => Ok(RecoveryLock::Relative(csv_sequence(*inactivity_blocks)?)),
            VaultProfile::MultisigDecay { decay_height, .. }
            | VaultProfile::ThreshDecay { decay_height, .. } => {
                Ok(RecoveryLock::Absolute(cltv_lock_time(*decay_height)?))
            }
        }
    }

    /// Typed requirements for spending through `path`.
    pub fn spend_plan(&self, path: SpendPath) -> Result<SpendPlan> {
        self.validate()?;

        let (lock_time, sequence) = match (path, self.recovery_lock()?) {
            // DeadManSwitch owner path disables any relative lock outright.
            (SpendPath::Primary, RecoveryLock::Relative(_)) => (LockTime::ZERO, Sequence::MAX),
            (SpendPath::Primary, RecoveryLock::Absolute(_)) => {
                (LockTime::ZERO, Sequence::ENABLE_RBF_NO_LOCKTIME)
            }
            (SpendPath::Recovery, RecoveryLock::Relative(seq)) => (LockTime::ZERO, seq),
            // Any nSequence below 0xFFFFFFFF makes nLockTime binding.
            (SpendPath::Recovery, RecoveryLock::Absolute(lock)) => {
                (lock, Sequence::ENABLE_LOCKTIME_NO_RBF)
            }
        };

        let primary = path == SpendPath::Primary;
        let shape = match self {
            VaultProfile::Timelock { owner, heir, .. }
            | VaultProfile::DeadManSwitch { owner, heir, .. } => WitnessShape::Checksig {
                key: if primary { *owner } else { *heir },
                branch: primary,
            },
            VaultProfile::MultisigDecay {
                heirs,
                initial_threshold,
                decayed_threshold,
                ..
            } => {
                if primary {
                    WitnessShape::Multisig {
                        threshold: *initial_threshold,
                        keys: sort_bip67(&self.keys()),
                        branch: true,
                    }
                } else {
                    WitnessShape::Multisig {
                        threshold: *decayed_threshold,
                        keys: sort_bip67(heirs),
                        branch: false,
                    }
                }
            }
            VaultProfile::ThreshDecay {
                pubkeys,
                initial_threshold,
                ..
            } => WitnessShape::Thresh {
                required: if primary {
                    *initial_threshold
                } else {
                    initial_threshold - 1
                },
                keys: sort_bip67(pubkeys),
                timelock: !primary,
            },
        };

        Ok(SpendPlan {
            path,
            lock_time,
            sequence,
            shape,
        })
    }
}

/// Convert an inactivity period in days to blocks.
pub fn days_to_blocks(days: u32) -> Result<u32> {
    days.checked_mul(BLOCKS_PER_DAY)
        .ok_or_else(|| invalid(format!("{} days overflows a block count", days)))
}

/// BIP-65 lock value. Heights below 500,000,000, UNIX timestamps above.
pub(crate) fn cltv_lock_time(value: u32) -> Result<LockTime> {
    if value == 0 {
        return Err(invalid("lock height must be positive"));
    }
    Ok(LockTime::from_consensus(value))
}

/// BIP-68 relative lock for an inactivity period in blocks.
///
/// Up to 65535 blocks the value is a plain block count. Longer periods switch
/// to 512-second units (bit 22), assuming 600 seconds per block.
pub(crate) fn csv_sequence(blocks: u32) -> Result<Sequence> {
    if blocks == 0 {
        return Err(invalid("inactivity period must be positive"));
    }
    if let Ok(height) = u16::try_from(blocks) {
        return Ok(Sequence::from_height(height));
    }

    let seconds = blocks
        .checked_mul(600)
        .ok_or_else(|| invalid(format!("{} blocks overflows seconds", blocks)))?;
    Sequence::from_seconds_floor(seconds).map_err(|_| {
        invalid(format!(
            "{} blocks (~{} days) exceeds the longest BIP-68 relative lock",
            blocks,
            blocks / BLOCKS_PER_DAY
        ))
    })
}

/// Human-readable duration of a block count.
pub(crate) fn approx_duration(blocks: u32) -> String {
    let days = blocks / BLOCKS_PER_DAY;
    if days >= 365 {
        format!("~{:.1} years ({} blocks)", days as f32 / 365.0, blocks)
    } else if days >= 30 {
        format!("~{:.1} months ({} blocks)", days as f32 / 30.0, blocks)
    } else {
        format!("~{} days ({} blocks)", days, blocks)
    }
}

fn check_threshold(threshold: usize, total: usize) -> Result<()> {
    if threshold == 0 || threshold > total {
        return Err(invalid(format!(
            "invalid threshold: {} of {} keys",
            threshold, total
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> VaultError {
    VaultError::InvalidProfileParameters(msg.into())
}
