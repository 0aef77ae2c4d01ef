//! Core records shared by the ledger, the jobs and the stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Conflict, FairslotError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies someone who competes for slots.
    RequesterId
);
id_type!(
    /// Identifies a reservable time window of a shared resource.
    SlotId
);
id_type!(
    /// Identifies an allocation request.
    RequestId
);
id_type!(
    /// Identifies a confirmed hold on a slot.
    ReservationId
);

/// Success rate assumed for requesters without history.
pub const DEFAULT_SUCCESS_RATE: f64 = 0.5;

/// A participant in the allocation, with the reputation data that drives priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub id: RequesterId,
    pub name: String,
    /// Never below zero
    pub credit_score: i32,
    pub total_requests: i32,
    pub successful_requests: i32,
    pub no_show_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Requester {
    pub fn new(name: impl Into<String>, credit_score: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: RequesterId::new(),
            name: name.into(),
            credit_score: credit_score.max(0),
            total_requests: 0,
            successful_requests: 0,
            no_show_count: 0,
            created_at: now,
        }
    }

    /// Fraction of submitted requests that ended in a reservation.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests <= 0 {
            return DEFAULT_SUCCESS_RATE;
        }
        (self.successful_requests as f64 / self.total_requests as f64).clamp(0.0, 1.0)
    }

    /// `(1 - success_rate) * credit_score / 100`.
    ///
    /// Lower historical success and higher credit both raise priority.
    pub fn priority_weight(&self) -> f64 {
        let credit_factor = self.credit_score.max(0) as f64 / 100.0;
        ((1.0 - self.success_rate()) * credit_factor).max(0.0)
    }

    pub fn record_submission(&mut self) {
        self.total_requests += 1;
    }

    pub fn record_success(&mut self) {
        self.successful_requests += 1;
    }

    /// Applies a no-show penalty, flooring the credit score at zero.
    pub fn record_no_show(&mut self, penalty: i32) {
        self.no_show_count += 1;
        self.credit_score = (self.credit_score - penalty.max(0)).max(0);
    }
}

/// A fixed time window of a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub resource_id: String,
    /// Local calendar date
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

impl Slot {
    pub fn new(
        resource_id: impl Into<String>,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SlotId::new(),
            resource_id: resource_id.into(),
            date,
            start_time,
            end_time,
            available: true,
            created_at: now,
        }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end_time)
    }

    /// Whether the window closed strictly before `local_now`.
    pub fn has_ended(&self, local_now: NaiveDateTime) -> bool {
        self.ends_at() < local_now
    }

    /// Half-open interval overlap against `[start, end)` on the same date.
    pub fn overlaps(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start_time < end && start < self.end_time
    }
}

/// Lifecycle of a reservation.
///
/// `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Completed,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = FairslotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            "no_show" => Ok(ReservationStatus::NoShow),
            other => Err(FairslotError::Other(anyhow::anyhow!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// A confirmed hold on a slot, from an allocation round, a waitlist promotion
/// or a direct booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub requester_id: RequesterId,
    pub slot_id: SlotId,
    /// Weak back-reference; direct bookings have none.
    pub request_id: Option<RequestId>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub no_show_at: Option<DateTime<Utc>>,
    /// 1-5
    pub rating: Option<i16>,
    pub feedback: Option<String>,
}

impl Reservation {
    pub fn new(
        requester_id: RequesterId,
        slot_id: SlotId,
        request_id: Option<RequestId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            requester_id,
            slot_id,
            request_id,
            status: ReservationStatus::Active,
            created_at: now,
            cancelled_at: None,
            no_show_at: None,
            rating: None,
            feedback: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ReservationStatus::Cancelled
    }

    /// Active -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ReservationStatus::Active => {
                self.status = ReservationStatus::Cancelled;
                self.cancelled_at = Some(now);
                Ok(())
            }
            ReservationStatus::Cancelled => Err(Conflict::AlreadyCancelled.into()),
            other => Err(self.refuse(other, ReservationStatus::Cancelled)),
        }
    }

    /// Active -> NoShow.
    pub fn mark_no_show(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ReservationStatus::Active => {
                self.status = ReservationStatus::NoShow;
                self.no_show_at = Some(now);
                Ok(())
            }
            other => Err(self.refuse(other, ReservationStatus::NoShow)),
        }
    }

    fn refuse(&self, from: ReservationStatus, to: ReservationStatus) -> FairslotError {
        FairslotError::InvalidTransition {
            entity: "reservation",
            id: self.id.to_string(),
            from: from.as_str(),
            to: to.as_str(),
        }
    }
}

/// Per-requester, per-week reservation counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyQuota {
    pub requester_id: RequesterId,
    /// Monday of the counted week
    pub week_start: NaiveDate,
    pub count: i32,
}

impl WeeklyQuota {
    pub fn empty(requester_id: RequesterId, week_start: NaiveDate) -> Self {
        Self {
            requester_id,
            week_start,
            count: 0,
        }
    }
}

/// The Monday on or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn requester(total: i32, successful: i32, credit: i32) -> Requester {
        let mut r = Requester::new("r", credit, Utc::now());
        r.total_requests = total;
        r.successful_requests = successful;
        r
    }

    #[rstest]
    #[case(0, 0, 100, 0.5)]
    #[case(4, 1, 100, 0.75)]
    #[case(4, 4, 100, 0.0)]
    #[case(2, 0, 50, 0.5)]
    #[case(0, 0, 0, 0.0)]
    fn test_priority_weight(
        #[case] total: i32,
        #[case] successful: i32,
        #[case] credit: i32,
        #[case] expected: f64,
    ) {
        let r = requester(total, successful, credit);
        assert!((r.priority_weight() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_no_show_penalty_floors_at_zero() {
        let mut r = requester(0, 0, 15);
        r.record_no_show(10);
        assert_eq!(r.credit_score, 5);
        r.record_no_show(10);
        assert_eq!(r.credit_score, 0);
        assert_eq!(r.no_show_count, 2);
    }

    #[rstest]
    #[case("2024-06-10", "2024-06-10")] // Monday
    #[case("2024-06-13", "2024-06-10")] // Thursday
    #[case("2024-06-16", "2024-06-10")] // Sunday
    fn test_week_start(#[case] date: &str, #[case] monday: &str) {
        let date: NaiveDate = date.parse().unwrap();
        let monday: NaiveDate = monday.parse().unwrap();
        assert_eq!(week_start(date), monday);
    }

    #[test]
    fn test_slot_overlap_is_half_open() {
        let t = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").unwrap();
        let slot = Slot::new(
            "court-1",
            "2024-06-10".parse().unwrap(),
            t("10:00"),
            t("11:00"),
            Utc::now(),
        );
        assert!(slot.overlaps(t("10:30"), t("11:30")));
        assert!(slot.overlaps(t("09:00"), t("12:00")));
        assert!(!slot.overlaps(t("11:00"), t("12:00")));
        assert!(!slot.overlaps(t("09:00"), t("10:00")));
    }

    #[test]
    fn test_reservation_transitions() {
        let now = Utc::now();
        let mut r = Reservation::new(RequesterId::new(), SlotId::new(), None, now);
        r.cancel(now).unwrap();
        assert!(r.is_cancelled());
        assert_eq!(r.cancelled_at, Some(now));

        let err = r.cancel(now).unwrap_err();
        assert_eq!(err.conflict(), Some(Conflict::AlreadyCancelled));

        let err = r.mark_no_show(now).unwrap_err();
        assert!(matches!(err, FairslotError::InvalidTransition { .. }));
    }

    #[test]
    fn test_reservation_status_round_trip_strings() {
        for status in [
            ReservationStatus::Active,
            ReservationStatus::Cancelled,
            ReservationStatus::Completed,
            ReservationStatus::NoShow,
        ] {
            assert_eq!(status.as_str().parse::<ReservationStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ReservationStatus>().is_err());
    }
}
