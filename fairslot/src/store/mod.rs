//! Storage abstraction.
//!
//! Every ledger operation and every job run works inside exactly one
//! [`Transaction`]. Dropping a transaction without calling
//! [`Transaction::commit`] rolls it back, so an early `?` return leaves no
//! partial writes behind.
//!
//! Implementations enforce the structural constraints themselves (foreign
//! keys, at most one non-cancelled reservation per slot, non-negative quota
//! counts) and serialize conflicting transactions on the rows they read for
//! mutation. Lifecycle rules are enforced by the request typestate and the
//! reservation transitions before anything reaches storage.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::request::{AnyRequest, Pending, Request, RequestState, RequestStatus};
use crate::types::{
    RequestId, RequesterId, Requester, Reservation, ReservationId, ReservationStatus, Slot, SlotId,
    WeeklyQuota,
};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// A backend that can open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx>;
}

/// A unit of work against the store.
///
/// `get_*` and `list_*` calls lock the rows they return until the transaction
/// ends. List results are ordered oldest first (slots by date and start time).
///
/// Paths that touch several tables lock slot rows before request rows, and a
/// requester's row before its quota counter.
#[async_trait]
pub trait Transaction: Send {
    // Requesters
    async fn insert_requester(&mut self, requester: &Requester) -> Result<()>;
    async fn get_requester(&mut self, id: RequesterId) -> Result<Option<Requester>>;
    async fn update_requester(&mut self, requester: &Requester) -> Result<()>;

    // Slots
    async fn insert_slot(&mut self, slot: &Slot) -> Result<()>;
    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>>;
    async fn set_slot_available(&mut self, id: SlotId, available: bool) -> Result<()>;
    async fn list_slots(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>>;

    /// Locks every slot that has pending requests, in id order, and returns
    /// them in that order. Allocation takes these locks before touching any
    /// request row, matching the slot-then-requests order of the ledger.
    async fn lock_pending_slots(&mut self) -> Result<Vec<Slot>>;

    // Requests
    async fn insert_request(&mut self, request: &Request<Pending>) -> Result<()>;

    /// Writes the request's current state over the stored row.
    async fn persist_request<T: RequestState + Clone>(
        &mut self,
        request: &Request<T>,
    ) -> Result<()>
    where
        AnyRequest: From<Request<T>>;

    async fn get_request(&mut self, id: RequestId) -> Result<Option<AnyRequest>>;
    async fn list_requests(&mut self, filter: &RequestFilter) -> Result<Vec<AnyRequest>>;

    /// Deletes requests submitted before `cutoff`. Reservations pointing at
    /// them must be deleted first.
    async fn delete_requests_applied_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64>;

    // Reservations
    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()>;
    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()>;
    async fn get_reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>>;
    async fn list_reservations(&mut self, filter: &ReservationFilter)
        -> Result<Vec<Reservation>>;
    async fn delete_reservation(&mut self, id: ReservationId) -> Result<()>;

    /// Deletes reservations created before `cutoff`, together with any that
    /// reference a request submitted before `cutoff`.
    async fn delete_reservations_expired(&mut self, cutoff: DateTime<Utc>) -> Result<u64>;

    // Weekly quotas
    async fn get_quota(
        &mut self,
        requester_id: RequesterId,
        week_start: NaiveDate,
    ) -> Result<Option<WeeklyQuota>>;

    /// Inserts or overwrites the counter for its (requester, week).
    async fn put_quota(&mut self, quota: &WeeklyQuota) -> Result<()>;

    async fn delete_quotas_before(&mut self, week_start: NaiveDate) -> Result<u64>;

    async fn commit(self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub resource_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub from_date: Option<NaiveDate>,
}

impl SlotFilter {
    pub fn matches(&self, slot: &Slot) -> bool {
        self.resource_id
            .as_ref()
            .is_none_or(|r| *r == slot.resource_id)
            && self.date.is_none_or(|d| d == slot.date)
            && self.from_date.is_none_or(|d| slot.date >= d)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub requester_id: Option<RequesterId>,
    pub slot_id: Option<SlotId>,
    pub status: Option<RequestStatus>,
}

impl RequestFilter {
    pub fn requester(mut self, id: RequesterId) -> Self {
        self.requester_id = Some(id);
        self
    }

    pub fn slot(mut self, id: SlotId) -> Self {
        self.slot_id = Some(id);
        self
    }

    pub fn status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, request: &AnyRequest) -> bool {
        let data = request.data();
        self.requester_id.is_none_or(|id| id == data.requester_id)
            && self.slot_id.is_none_or(|id| id == data.slot_id)
            && self.status.is_none_or(|s| s == request.status())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub requester_id: Option<RequesterId>,
    pub slot_id: Option<SlotId>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn requester(mut self, id: RequesterId) -> Self {
        self.requester_id = Some(id);
        self
    }

    pub fn slot(mut self, id: SlotId) -> Self {
        self.slot_id = Some(id);
        self
    }

    pub fn status(mut self, status: ReservationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.requester_id
            .is_none_or(|id| id == reservation.requester_id)
            && self.slot_id.is_none_or(|id| id == reservation.slot_id)
            && self.status.is_none_or(|s| s == reservation.status)
    }
}
