use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FairslotError, Result};

/// Policy knobs for the allocation engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum reservations a requester may gain per calendar week
    pub weekly_quota_max: i32,
    /// Credit deducted for each no-show
    pub no_show_penalty: i32,
    /// Requests and reservations older than this are pruned
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Credit score given to newly registered requesters
    pub initial_credit_score: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weekly_quota_max: 3,
            no_show_penalty: 10,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            initial_credit_score: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.weekly_quota_max < 1 {
            return Err(FairslotError::Validation(format!(
                "weekly_quota_max must be at least 1, got {}",
                self.weekly_quota_max
            )));
        }
        if self.no_show_penalty < 0 {
            return Err(FairslotError::Validation(format!(
                "no_show_penalty cannot be negative, got {}",
                self.no_show_penalty
            )));
        }
        if self.retention.is_zero() {
            return Err(FairslotError::Validation(
                "retention must be greater than zero".to_string(),
            ));
        }
        if self.initial_credit_score < 0 {
            return Err(FairslotError::Validation(format!(
                "initial_credit_score cannot be negative, got {}",
                self.initial_credit_score
            )));
        }
        Ok(())
    }

    /// Retention horizon as a chrono duration.
    pub(crate) fn retention_horizon(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.retention).map_err(|e| {
            FairslotError::Validation(format!("retention is out of range: {e}"))
        })
    }
}
