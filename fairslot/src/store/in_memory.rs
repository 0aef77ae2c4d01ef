//! In-memory store.
//!
//! A single async mutex guards the whole state, so transactions run one at a
//! time. Each transaction mutates a private copy that replaces the shared
//! state on commit; dropping the transaction discards the copy. Suitable for
//! tests and single-process deployments. Everything is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Conflict, FairslotError, Result};
use crate::request::{AnyRequest, Pending, Request, RequestState, RequestStatus};
use crate::types::{
    RequestId, Requester, RequesterId, Reservation, ReservationId, Slot, SlotId, WeeklyQuota,
};

use super::{RequestFilter, ReservationFilter, SlotFilter, Store, Transaction};

#[derive(Debug, Clone, Default)]
struct State {
    requesters: HashMap<RequesterId, Requester>,
    slots: HashMap<SlotId, Slot>,
    requests: HashMap<RequestId, AnyRequest>,
    reservations: HashMap<ReservationId, Reservation>,
    quotas: HashMap<(RequesterId, NaiveDate), WeeklyQuota>,
}

fn violation(message: String) -> FairslotError {
    FairslotError::Other(anyhow::anyhow!("constraint violation: {message}"))
}

impl State {
    fn require_requester(&self, id: RequesterId) -> Result<()> {
        if self.requesters.contains_key(&id) {
            Ok(())
        } else {
            Err(violation(format!("requester {id} does not exist")))
        }
    }

    fn require_slot(&self, id: SlotId) -> Result<()> {
        if self.slots.contains_key(&id) {
            Ok(())
        } else {
            Err(violation(format!("slot {id} does not exist")))
        }
    }

    /// At most one non-cancelled reservation per slot.
    fn check_slot_exclusive(&self, reservation: &Reservation) -> Result<()> {
        if reservation.is_cancelled() {
            return Ok(());
        }
        let taken = self.reservations.values().any(|other| {
            other.id != reservation.id
                && other.slot_id == reservation.slot_id
                && !other.is_cancelled()
        });
        if taken {
            return Err(Conflict::ActiveReservationExists.into());
        }
        Ok(())
    }
}

/// In-memory implementation of [`Store`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction { guard, working })
    }
}

/// Holds the store lock for its whole lifetime.
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn insert_requester(&mut self, requester: &Requester) -> Result<()> {
        if self.working.requesters.contains_key(&requester.id) {
            return Err(violation(format!("requester {} already exists", requester.id)));
        }
        self.working
            .requesters
            .insert(requester.id, requester.clone());
        Ok(())
    }

    async fn get_requester(&mut self, id: RequesterId) -> Result<Option<Requester>> {
        Ok(self.working.requesters.get(&id).cloned())
    }

    async fn update_requester(&mut self, requester: &Requester) -> Result<()> {
        if requester.credit_score < 0 {
            return Err(violation(format!(
                "requester {} credit_score below zero",
                requester.id
            )));
        }
        match self.working.requesters.get_mut(&requester.id) {
            Some(stored) => {
                *stored = requester.clone();
                Ok(())
            }
            None => Err(FairslotError::not_found("requester", requester.id)),
        }
    }

    async fn insert_slot(&mut self, slot: &Slot) -> Result<()> {
        if slot.start_time >= slot.end_time {
            return Err(violation(format!("slot {} ends before it starts", slot.id)));
        }
        if self.working.slots.contains_key(&slot.id) {
            return Err(violation(format!("slot {} already exists", slot.id)));
        }
        self.working.slots.insert(slot.id, slot.clone());
        Ok(())
    }

    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>> {
        Ok(self.working.slots.get(&id).cloned())
    }

    async fn set_slot_available(&mut self, id: SlotId, available: bool) -> Result<()> {
        match self.working.slots.get_mut(&id) {
            Some(slot) => {
                slot.available = available;
                Ok(())
            }
            None => Err(FairslotError::not_found("slot", id)),
        }
    }

    async fn list_slots(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>> {
        let mut slots: Vec<Slot> = self
            .working
            .slots
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        slots.sort_by(|a, b| {
            (a.date, a.start_time, &a.resource_id).cmp(&(b.date, b.start_time, &b.resource_id))
        });
        Ok(slots)
    }

    async fn lock_pending_slots(&mut self) -> Result<Vec<Slot>> {
        let mut ids: Vec<SlotId> = self
            .working
            .requests
            .values()
            .filter(|r| r.status() == RequestStatus::Pending)
            .map(|r| r.data().slot_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|id| {
                self.working
                    .slots
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| FairslotError::not_found("slot", id))
            })
            .collect()
    }

    async fn insert_request(&mut self, request: &Request<Pending>) -> Result<()> {
        self.working.require_requester(request.data.requester_id)?;
        self.working.require_slot(request.data.slot_id)?;
        if self.working.requests.contains_key(&request.data.id) {
            return Err(violation(format!("request {} already exists", request.data.id)));
        }
        self.working
            .requests
            .insert(request.data.id, request.clone().into());
        Ok(())
    }

    async fn persist_request<T: RequestState + Clone>(
        &mut self,
        request: &Request<T>,
    ) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        match self.working.requests.get_mut(&request.data.id) {
            Some(stored) => {
                *stored = AnyRequest::from(request.clone());
                Ok(())
            }
            None => Err(FairslotError::not_found("request", request.data.id)),
        }
    }

    async fn get_request(&mut self, id: RequestId) -> Result<Option<AnyRequest>> {
        Ok(self.working.requests.get(&id).cloned())
    }

    async fn list_requests(&mut self, filter: &RequestFilter) -> Result<Vec<AnyRequest>> {
        let mut requests: Vec<AnyRequest> = self
            .working
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        requests.sort_by_key(|r| (r.data().applied_at, r.id()));
        Ok(requests)
    }

    async fn delete_requests_applied_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let doomed: Vec<RequestId> = self
            .working
            .requests
            .values()
            .filter(|r| r.data().applied_at < cutoff)
            .map(|r| r.id())
            .collect();
        if let Some(dangling) = self
            .working
            .reservations
            .values()
            .find(|res| res.request_id.is_some_and(|id| doomed.contains(&id)))
        {
            return Err(violation(format!(
                "reservation {} still references a request being deleted",
                dangling.id
            )));
        }
        for id in &doomed {
            self.working.requests.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.working.require_requester(reservation.requester_id)?;
        self.working.require_slot(reservation.slot_id)?;
        if let Some(request_id) = reservation.request_id {
            if !self.working.requests.contains_key(&request_id) {
                return Err(violation(format!("request {request_id} does not exist")));
            }
        }
        if self.working.reservations.contains_key(&reservation.id) {
            return Err(violation(format!(
                "reservation {} already exists",
                reservation.id
            )));
        }
        self.working.check_slot_exclusive(reservation)?;
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        if !self.working.reservations.contains_key(&reservation.id) {
            return Err(FairslotError::not_found("reservation", reservation.id));
        }
        self.working.check_slot_exclusive(reservation)?;
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get_reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.working.reservations.get(&id).cloned())
    }

    async fn list_reservations(
        &mut self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>> {
        let mut reservations: Vec<Reservation> = self
            .working
            .reservations
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        reservations.sort_by_key(|r| (r.created_at, r.id));
        Ok(reservations)
    }

    async fn delete_reservation(&mut self, id: ReservationId) -> Result<()> {
        match self.working.reservations.remove(&id) {
            Some(_) => Ok(()),
            None => Err(FairslotError::not_found("reservation", id)),
        }
    }

    async fn delete_reservations_expired(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let requests = &self.working.requests;
        let before = self.working.reservations.len();
        self.working.reservations.retain(|_, res| {
            let request_expired = res
                .request_id
                .and_then(|id| requests.get(&id))
                .is_some_and(|r| r.data().applied_at < cutoff);
            !(res.created_at < cutoff || request_expired)
        });
        Ok((before - self.working.reservations.len()) as u64)
    }

    async fn get_quota(
        &mut self,
        requester_id: RequesterId,
        week_start: NaiveDate,
    ) -> Result<Option<WeeklyQuota>> {
        Ok(self
            .working
            .quotas
            .get(&(requester_id, week_start))
            .cloned())
    }

    async fn put_quota(&mut self, quota: &WeeklyQuota) -> Result<()> {
        self.working.require_requester(quota.requester_id)?;
        if quota.count < 0 {
            return Err(violation(format!(
                "quota for requester {} is negative",
                quota.requester_id
            )));
        }
        self.working
            .quotas
            .insert((quota.requester_id, quota.week_start), quota.clone());
        Ok(())
    }

    async fn delete_quotas_before(&mut self, week_start: NaiveDate) -> Result<u64> {
        let before = self.working.quotas.len();
        self.working.quotas.retain(|(_, week), _| *week >= week_start);
        Ok((before - self.working.quotas.len()) as u64)
    }

    async fn commit(self) -> Result<()> {
        let InMemoryTransaction { mut guard, working } = self;
        *guard = working;
        Ok(())
    }
}

impl InMemoryTransaction {
    /// Number of non-cancelled reservations per slot; used by invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn live_reservations_for(&self, slot_id: SlotId) -> usize {
        self.working
            .reservations
            .values()
            .filter(|r| r.slot_id == slot_id && !r.is_cancelled())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn slot(now: DateTime<Utc>) -> Slot {
        Slot::new(
            "court-1",
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            now,
        )
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let requester = Requester::new("alice", 100, now);

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_requester(&requester).await.unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_requester(requester.id).await.unwrap().is_none());
        tx.insert_requester(&requester).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.get_requester(requester.id).await.unwrap(),
            Some(requester)
        );
    }

    #[tokio::test]
    async fn test_lock_pending_slots_is_distinct_and_id_ordered() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let alice = Requester::new("alice", 100, now);
        let bob = Requester::new("bob", 100, now);
        let slots = [slot(now), slot(now), slot(now)];

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&alice).await.unwrap();
        tx.insert_requester(&bob).await.unwrap();
        for s in &slots {
            tx.insert_slot(s).await.unwrap();
        }
        // Two pending on the first slot, one decided on the second, one
        // pending on the third.
        for requester in [&alice, &bob] {
            let request = Request::<Pending>::new(requester.id, slots[0].id, 0.5, now);
            tx.insert_request(&request).await.unwrap();
        }
        let decided = Request::<Pending>::new(alice.id, slots[1].id, 0.5, now);
        tx.insert_request(&decided).await.unwrap();
        decided.reject(Some(1), now, &mut tx).await.unwrap();
        let request = Request::<Pending>::new(bob.id, slots[2].id, 0.5, now);
        tx.insert_request(&request).await.unwrap();

        let mut expected = vec![slots[0].id, slots[2].id];
        expected.sort();
        let locked: Vec<SlotId> = tx
            .lock_pending_slots()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(locked, expected);
    }

    #[tokio::test]
    async fn test_one_live_reservation_per_slot() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let alice = Requester::new("alice", 100, now);
        let bob = Requester::new("bob", 100, now);
        let slot = slot(now);

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&alice).await.unwrap();
        tx.insert_requester(&bob).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();

        let mut first = Reservation::new(alice.id, slot.id, None, now);
        tx.insert_reservation(&first).await.unwrap();

        let second = Reservation::new(bob.id, slot.id, None, now);
        let err = tx.insert_reservation(&second).await.unwrap_err();
        assert_eq!(err.conflict(), Some(Conflict::ActiveReservationExists));

        first.cancel(now).unwrap();
        tx.update_reservation(&first).await.unwrap();
        tx.insert_reservation(&second).await.unwrap();
        assert_eq!(tx.live_reservations_for(slot.id), 1);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();

        let orphan = Request::<Pending>::new(RequesterId::new(), SlotId::new(), 0.5, now);
        assert!(tx.insert_request(&orphan).await.is_err());

        let quota = WeeklyQuota::empty(RequesterId::new(), now.date_naive());
        assert!(tx.put_quota(&quota).await.is_err());
    }

    #[tokio::test]
    async fn test_retention_deletes_dependents_first() {
        let store = InMemoryStore::new();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let alice = Requester::new("alice", 100, old);
        let slot = slot(old);
        let request = Request::<Pending>::new(alice.id, slot.id, 0.5, old);
        // Reservation itself is recent but points at an old request.
        let reservation = Reservation::new(alice.id, slot.id, Some(request.data.id), recent);

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&alice).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();
        tx.insert_request(&request).await.unwrap();
        tx.insert_reservation(&reservation).await.unwrap();

        assert!(tx.delete_requests_applied_before(cutoff).await.is_err());
        assert_eq!(tx.delete_reservations_expired(cutoff).await.unwrap(), 1);
        assert_eq!(tx.delete_requests_applied_before(cutoff).await.unwrap(), 1);
    }
}
