//! Timelock status and check-in urgency
//!
//! A check-in spends the vault through its primary path and recreates the
//! UTXO at the same address (see [`crate::psbt::build_checkin_psbt`]). For a
//! dead man's switch that restarts the relative lock. Absolute locks cannot be
//! pushed back; the owner has to move the funds to a new vault instead.

use serde::{Deserialize, Serialize};

/// How urgently the owner needs to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinUrgency {
    None,
    Warning,
    Critical,
    Expired,
}

/// Where a recovery lock stands relative to the chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockStatus {
    /// Height from which the recovery path is spendable, for height locks.
    pub unlock_height: Option<u32>,
    /// Median-time-past from which the recovery path is spendable, for
    /// timestamp locks.
    pub unlock_time: Option<u32>,
    /// Estimated at 600 seconds per block for timestamp locks.
    pub blocks_remaining: u32,
    pub expired: bool,
}

impl TimelockStatus {
    /// Status of a relative lock of `timelock_blocks` on a UTXO confirmed at
    /// `utxo_height`.
    ///
    /// Counts from the tip: `expired` is set once the tip itself reaches
    /// `utxo_height + timelock_blocks`. A recovery spend can already be relayed
    /// one block earlier, since the next block satisfies the lock.
    pub fn calculate(current_height: u32, utxo_height: u32, timelock_blocks: u32) -> Self {
        Self::at_height(current_height, utxo_height.saturating_add(timelock_blocks))
    }

    /// Status of an absolute height lock.
    pub fn at_height(current_height: u32, unlock_height: u32) -> Self {
        Self {
            unlock_height: Some(unlock_height),
            unlock_time: None,
            blocks_remaining: unlock_height.saturating_sub(current_height),
            expired: current_height >= unlock_height,
        }
    }

    /// Status of an absolute timestamp lock.
    pub fn at_time(median_time_past: u32, unlock_time: u32) -> Self {
        let seconds = unlock_time.saturating_sub(median_time_past);
        Self {
            unlock_height: None,
            unlock_time: Some(unlock_time),
            blocks_remaining: seconds.div_ceil(600),
            expired: median_time_past >= unlock_time,
        }
    }

    pub fn urgency(&self, elapsed_fraction: f64, warning: f64, critical: f64) -> CheckinUrgency {
        if self.expired {
            CheckinUrgency::Expired
        } else if elapsed_fraction >= critical {
            CheckinUrgency::Critical
        } else if elapsed_fraction >= warning {
            CheckinUrgency::Warning
        } else {
            CheckinUrgency::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_status() {
        let status = TimelockStatus::calculate(800_100, 800_000, 1_000);
        assert_eq!(status.unlock_height, Some(801_000));
        assert_eq!(status.blocks_remaining, 900);
        assert!(!status.expired);

        // Tip one short: the next block could carry the spend, still not expired
        let status = TimelockStatus::calculate(800_999, 800_000, 1_000);
        assert_eq!(status.blocks_remaining, 1);
        assert!(!status.expired);

        let status = TimelockStatus::calculate(801_000, 800_000, 1_000);
        assert_eq!(status.blocks_remaining, 0);
        assert!(status.expired);
    }

    #[test]
    fn test_absolute_height_status() {
        assert!(!TimelockStatus::at_height(899_999, 900_000).expired);
        assert!(TimelockStatus::at_height(900_000, 900_000).expired);
        assert_eq!(TimelockStatus::at_height(899_000, 900_000).blocks_remaining, 1_000);
    }

    #[test]
    fn test_time_status() {
        let status = TimelockStatus::at_time(1_700_000_000, 1_700_006_000);
        assert_eq!(status.unlock_time, Some(1_700_006_000));
        assert_eq!(status.blocks_remaining, 10);
        assert!(!status.expired);
        assert!(TimelockStatus::at_time(1_700_006_000, 1_700_006_000).expired);
    }

    #[test]
    fn test_urgency_ordering() {
        assert!(CheckinUrgency::None < CheckinUrgency::Warning);
        assert!(CheckinUrgency::Critical < CheckinUrgency::Expired);

        let status = TimelockStatus::at_height(100, 1_000);
        assert_eq!(status.urgency(0.2, 0.5, 0.9), CheckinUrgency::None);
        assert_eq!(status.urgency(0.5, 0.5, 0.9), CheckinUrgency::Warning);
        assert_eq!(status.urgency(0.95, 0.5, 0.9), CheckinUrgency::Critical);
    }
}
