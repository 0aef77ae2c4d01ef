//! Read models returned by the ledger's query operations.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::request::{AnyRequest, RequestStatus};
use crate::types::{
    RequestId, Requester, RequesterId, Reservation, ReservationId, ReservationStatus, Slot, SlotId,
};

/// A request together with the window it targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestView {
    pub request_id: RequestId,
    pub slot_id: SlotId,
    pub resource_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: RequestStatus,
    pub priority_weight: f64,
    pub queue_position: Option<u32>,
    pub applied_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RequestView {
    pub(crate) fn new(request: &AnyRequest, slot: &Slot) -> Self {
        let data = request.data();
        Self {
            request_id: data.id,
            slot_id: slot.id,
            resource_id: slot.resource_id.clone(),
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            status: request.status(),
            priority_weight: data.priority_weight,
            queue_position: request.queue_position(),
            applied_at: data.applied_at,
            processed_at: request.processed_at(),
        }
    }
}

/// Reservation status as presented to requesters; an active reservation is
/// shown as confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl From<ReservationStatus> for RecordStatus {
    fn from(status: ReservationStatus) -> Self {
        match status {
            ReservationStatus::Active => RecordStatus::Confirmed,
            ReservationStatus::Cancelled => RecordStatus::Cancelled,
            ReservationStatus::Completed => RecordStatus::Completed,
            ReservationStatus::NoShow => RecordStatus::NoShow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    pub reservation_id: ReservationId,
    pub request_id: Option<RequestId>,
    pub slot_id: SlotId,
    pub resource_id: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub rating: Option<i16>,
    pub feedback: Option<String>,
}

impl ReservationView {
    pub(crate) fn new(reservation: &Reservation, slot: &Slot) -> Self {
        Self {
            reservation_id: reservation.id,
            request_id: reservation.request_id,
            slot_id: slot.id,
            resource_id: slot.resource_id.clone(),
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            status: reservation.status.into(),
            created_at: reservation.created_at,
            cancelled_at: reservation.cancelled_at,
            rating: reservation.rating,
            feedback: reservation.feedback.clone(),
        }
    }
}

/// Aggregate reputation of a requester.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationStats {
    pub credit_score: i32,
    pub total_requests: i32,
    pub successful_requests: i32,
    pub no_show_count: i32,
    pub success_rate: f64,
}

impl From<&Requester> for ReputationStats {
    fn from(requester: &Requester) -> Self {
        Self {
            credit_score: requester.credit_score,
            total_requests: requester.total_requests,
            successful_requests: requester.successful_requests,
            no_show_count: requester.no_show_count,
            success_rate: requester.success_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordsView {
    /// Newest first
    pub reservations: Vec<ReservationView>,
    pub stats: ReputationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditView {
    pub requester_id: RequesterId,
    pub name: String,
    #[serde(flatten)]
    pub stats: ReputationStats,
    /// Weight a request submitted now would carry
    pub priority_weight: f64,
    pub weekly_quota_used: i32,
    pub weekly_quota_max: i32,
}

/// Derived occupancy of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAvailability {
    Available,
    HasRequests,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    #[serde(flatten)]
    pub slot: Slot,
    pub availability: SlotAvailability,
    pub pending_requests: usize,
}

impl SlotView {
    pub(crate) fn new(slot: Slot, reserved: bool, pending_requests: usize) -> Self {
        let availability = if !slot.available || reserved {
            SlotAvailability::Reserved
        } else if pending_requests > 0 {
            SlotAvailability::HasRequests
        } else {
            SlotAvailability::Available
        };
        Self {
            slot,
            availability,
            pending_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(true, false, 0, SlotAvailability::Available)]
    #[case(true, false, 2, SlotAvailability::HasRequests)]
    #[case(false, false, 2, SlotAvailability::Reserved)]
    #[case(true, true, 0, SlotAvailability::Reserved)]
    fn test_slot_availability(
        #[case] available: bool,
        #[case] reserved: bool,
        #[case] pending: usize,
        #[case] expected: SlotAvailability,
    ) {
        let mut slot = Slot::new(
            "court-1",
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            Utc::now(),
        );
        slot.available = available;
        assert_eq!(SlotView::new(slot, reserved, pending).availability, expected);
    }

    #[test]
    fn test_active_reservation_reads_as_confirmed() {
        assert_eq!(
            RecordStatus::from(ReservationStatus::Active),
            RecordStatus::Confirmed
        );
        assert_eq!(
            serde_json::to_value(RecordStatus::NoShow).unwrap(),
            serde_json::json!("no_show")
        );
    }
}
