//! Heartbeat evaluation for vault recovery locks.
//!
//! Pure logic: no I/O, no network. Takes chain state, returns a
//! recommendation. The caller decides whether to act on it.
//!
//! # How It Works
//!
//! Every profile gates its recovery path behind a lock. The heartbeat measures
//! how much of that lock has elapsed since the vault UTXO confirmed:
//!
//! ```text
//! |--- Healthy ---|--- CheckinRecommended ---|--- CheckinRequired ---|--- Expired
//! 0%             50%                        90%                    100%
//! ```
//!
//! Thresholds are configurable. For a dead man's switch the clock restarts
//! with every check-in; for absolute locks it runs to a fixed point.

use serde::{Deserialize, Serialize};

use crate::checkin::{CheckinUrgency, TimelockStatus};
use crate::error::VaultError;
use crate::profile::RecoveryLock;
use crate::vault::Vault;

/// Heartbeat configuration: when to recommend check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Fraction of the lock elapsed before recommending check-in (0.0–1.0).
    /// Default: 0.5 (halfway point).
    pub checkin_threshold: f64,

    /// Fraction of the lock elapsed before check-in is critical (0.0–1.0).
    /// Default: 0.9.
    pub critical_threshold: f64,

    /// How often the caller should poll chain state (seconds). Advisory only.
    pub poll_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            checkin_threshold: 0.5,
            critical_threshold: 0.9,
            poll_interval_secs: 3600,
        }
    }
}

impl HeartbeatConfig {
    /// Validate that thresholds are sensible.
    pub fn validate(&self) -> Result<(), HeartbeatError> {
        if self.checkin_threshold <= 0.0 || self.checkin_threshold >= 1.0 {
            return Err(HeartbeatError::InvalidThreshold(
                "checkin_threshold must be between 0.0 and 1.0 exclusive".into(),
            ));
        }
        if self.critical_threshold <= self.checkin_threshold || self.critical_threshold >= 1.0 {
            return Err(HeartbeatError::InvalidThreshold(
                "critical_threshold must be between checkin_threshold and 1.0 exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Chain tip as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPosition {
    pub height: u32,
    /// BIP-113 median time past of the tip. Only timestamp locks use it.
    pub median_time_past: u32,
}

impl ChainPosition {
    pub fn at_height(height: u32) -> Self {
        Self {
            height,
            median_time_past: 0,
        }
    }
}

/// What the heartbeat recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatAction {
    /// Lock is far from expiry. No action needed.
    Healthy,
    /// Passed the check-in threshold. Should check in soon.
    CheckinRecommended,
    /// Passed the critical threshold. Must check in now.
    CheckinRequired,
    /// Lock expired. The recovery path is open.
    Expired,
}

impl HeartbeatAction {
    pub fn to_urgency(self) -> CheckinUrgency {
        match self {
            HeartbeatAction::Healthy => CheckinUrgency::None,
            HeartbeatAction::CheckinRecommended => CheckinUrgency::Warning,
            HeartbeatAction::CheckinRequired => CheckinUrgency::Critical,
            HeartbeatAction::Expired => CheckinUrgency::Expired,
        }
    }

    fn priority(self) -> u8 {
        match self {
            HeartbeatAction::Expired => 0,
            HeartbeatAction::CheckinRequired => 1,
            HeartbeatAction::CheckinRecommended => 2,
            HeartbeatAction::Healthy => 3,
        }
    }
}

/// Full heartbeat status for a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub vault_address: String,
    pub profile: String,
    pub timelock_status: TimelockStatus,
    /// Fraction of the lock elapsed (0.0–1.0+).
    pub elapsed_fraction: f64,
    pub action: HeartbeatAction,
    /// Whether a check-in pushes the lock back. False for absolute locks,
    /// which only a move to a new vault can extend.
    pub renewable_by_checkin: bool,
}

/// Errors from heartbeat evaluation.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Evaluate the heartbeat of a vault whose UTXO confirmed at `utxo_height`.
pub fn evaluate_heartbeat(
    vault: &Vault,
    utxo_height: u32,
    chain: &ChainPosition,
    config: &HeartbeatConfig,
) -> Result<HeartbeatStatus, HeartbeatError> {
    let blocks_elapsed = chain.height.saturating_sub(utxo_height);

    let (timelock_status, elapsed_fraction, renewable) = match vault.profile.recovery_lock()? {
        RecoveryLock::Relative(sequence) => {
            let blocks = relative_blocks(sequence);
            let status = TimelockStatus::calculate(chain.height, utxo_height, blocks);
            (status, fraction(blocks_elapsed, blocks), true)
        }
        RecoveryLock::Absolute(lock) if lock.is_block_height() => {
            let unlock = lock.to_consensus_u32();
            let status = TimelockStatus::at_height(chain.height, unlock);
            let total = unlock.saturating_sub(utxo_height);
            (status, fraction(blocks_elapsed, total), false)
        }
        RecoveryLock::Absolute(lock) => {
            let unlock = lock.to_consensus_u32();
            let status = TimelockStatus::at_time(chain.median_time_past, unlock);
            // Confirmation time estimated at 600 seconds per block.
            let funded_at = chain
                .median_time_past
                .saturating_sub(blocks_elapsed.saturating_mul(600));
            let total = unlock.saturating_sub(funded_at);
            let elapsed = chain.median_time_past.saturating_sub(funded_at);
            (status, fraction(elapsed, total), false)
        }
    };

    let action = if timelock_status.expired {
        HeartbeatAction::Expired
    } else if elapsed_fraction >= config.critical_threshold {
        HeartbeatAction::CheckinRequired
    } else if elapsed_fraction >= config.checkin_threshold {
        HeartbeatAction::CheckinRecommended
    } else {
        HeartbeatAction::Healthy
    };

    if action != HeartbeatAction::Healthy {
        log::debug!(
            "Vault {} at {:.0}% of its recovery lock: {:?}",
            vault.address,
            elapsed_fraction * 100.0,
            action
        );
    }

    Ok(HeartbeatStatus {
        vault_address: vault.address.to_string(),
        profile: vault.profile.kind().to_string(),
        timelock_status,
        elapsed_fraction,
        action,
        renewable_by_checkin: renewable,
    })
}

/// Batch evaluate heartbeat for multiple vaults.
///
/// Returns statuses sorted by urgency (most urgent first).
pub fn evaluate_batch(
    vaults: &[(Vault, u32)], // (vault, utxo_height)
    chain: &ChainPosition,
    config: &HeartbeatConfig,
) -> Result<Vec<HeartbeatStatus>, HeartbeatError> {
    let mut statuses = vaults
        .iter()
        .map(|(vault, utxo_height)| evaluate_heartbeat(vault, *utxo_height, chain, config))
        .collect::<Result<Vec<_>, _>>()?;

    statuses.sort_by(|a, b| {
        a.action.priority().cmp(&b.action.priority()).then(
            a.elapsed_fraction
                .partial_cmp(&b.elapsed_fraction)
                .unwrap_or(std::cmp::Ordering::Equal)
                .reverse(),
        )
    });

    Ok(statuses)
}

fn fraction(elapsed: u32, total: u32) -> f64 {
    if total == 0 {
        1.0
    } else {
        elapsed as f64 / total as f64
    }
}

/// Length of a BIP-68 lock in blocks. 512-second units are converted at
/// 600 seconds per block.
fn relative_blocks(sequence: bitcoin::Sequence) -> u32 {
    use bitcoin::relative::LockTime;

    match sequence.to_relative_lock_time() {
        Some(LockTime::Blocks(height)) => u32::from(height.value()),
        Some(LockTime::Time(time)) => (u32::from(time.value()) * 512).div_ceil(600),
        None => 0,
    }
}
