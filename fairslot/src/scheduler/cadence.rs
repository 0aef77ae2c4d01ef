use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{FairslotError, Result};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// When a job fires, in local wall-clock time.
///
/// ```yaml
/// allocation:
///   daily: { hour: 22, minute: 0 }
/// waitlist:
///   every: 10m
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Once a day at `hour:minute`
    Daily { hour: u32, minute: u32 },
    /// Every interval, aligned to multiples of the interval since midnight
    Every(#[serde(with = "humantime_serde")] Duration),
}

impl Cadence {
    pub fn daily(hour: u32, minute: u32) -> Self {
        Cadence::Daily { hour, minute }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Cadence::Daily { hour, minute } => {
                if hour > 23 || minute > 59 {
                    return Err(FairslotError::Validation(format!(
                        "daily cadence {hour:02}:{minute:02} is not a valid time of day"
                    )));
                }
            }
            Cadence::Every(interval) => {
                if interval.as_secs() == 0 {
                    return Err(FairslotError::Validation(
                        "interval cadence must be at least one second".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The first firing strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Cadence::Daily { hour, minute } => {
                let at = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0)
                    .unwrap_or(NaiveTime::MIN);
                let today = now.date().and_time(at);
                if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
            Cadence::Every(interval) => {
                let period = interval.as_secs().clamp(1, SECONDS_PER_DAY);
                let midnight = now.date().and_time(NaiveTime::MIN);
                let elapsed = now.time().num_seconds_from_midnight() as u64;
                let next = (elapsed / period + 1) * period;
                // Alignment restarts at midnight when the period does not divide a day.
                let next = next.min(SECONDS_PER_DAY);
                midnight + chrono::Duration::seconds(next as i64)
            }
        }
    }
}

/// Cadence for each engine job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub allocation: Cadence,
    pub reputation: Cadence,
    pub retention: Cadence,
    pub waitlist: Cadence,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            allocation: Cadence::daily(22, 0),
            reputation: Cadence::daily(1, 0),
            retention: Cadence::daily(2, 0),
            waitlist: Cadence::Every(Duration::from_secs(10 * 60)),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        self.allocation.validate()?;
        self.reputation.validate()?;
        self.retention.validate()?;
        self.waitlist.validate()
    }
}
