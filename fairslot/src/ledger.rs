//! Requester-facing operations.
//!
//! Every call runs in a single store transaction; any error rolls it back.
//! Checks and writes happen on rows locked by that transaction, so two
//! concurrent submissions for the same slot cannot both pass the availability
//! and duplicate checks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::instrument;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Conflict, FairslotError, Result};
use crate::quota::QuotaTracker;
use crate::request::{AnyRequest, Approved, Pending, Request, RequestStatus};
use crate::store::{RequestFilter, ReservationFilter, SlotFilter, Store, Transaction};
use crate::types::{RequestId, Requester, RequesterId, Reservation, ReservationId, Slot, SlotId};
use crate::views::{CreditView, RecordsView, RequestView, ReservationView, SlotView};

/// Which request a cancellation applies to. Both forms are scoped to the
/// requester issuing the cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Request(RequestId),
    /// The requester's active request for this slot
    Slot(SlotId),
}

/// Filter for [`RequestLedger::list_slots`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotQuery {
    pub resource_id: Option<String>,
    pub date: Option<NaiveDate>,
    /// Defaults to today
    pub from_date: Option<NaiveDate>,
}

pub struct RequestLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    quota: QuotaTracker,
}

impl<S: Store> RequestLedger<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            config: config.clone(),
            quota: QuotaTracker::new(config.weekly_quota_max),
        }
    }

    // ------------------------------------------------------------------------
    // Requesters
    // ------------------------------------------------------------------------

    #[instrument(skip(self), err)]
    pub async fn register_requester(&self, name: &str) -> Result<RequesterId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FairslotError::Validation(
                "requester name cannot be empty".to_string(),
            ));
        }
        let requester = Requester::new(name, self.config.initial_credit_score, self.clock.now());
        let mut tx = self.store.begin().await?;
        tx.insert_requester(&requester).await?;
        tx.commit().await?;
        tracing::info!(requester_id = %requester.id, "Requester registered");
        Ok(requester.id)
    }

    #[instrument(skip_all, fields(requester_id = %requester_id), err)]
    pub async fn query_credit(&self, requester_id: RequesterId) -> Result<CreditView> {
        let mut tx = self.store.begin().await?;
        let requester = load_requester(&mut tx, requester_id).await?;
        let used = self
            .quota
            .used(&mut tx, requester_id, self.clock.local_today())
            .await?;
        Ok(CreditView {
            requester_id,
            name: requester.name.clone(),
            stats: (&requester).into(),
            priority_weight: requester.priority_weight(),
            weekly_quota_used: used,
            weekly_quota_max: self.quota.max(),
        })
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Enters a request into the next allocation round.
    #[instrument(skip_all, fields(requester_id = %requester_id, slot_id = %slot_id), err)]
    pub async fn submit(&self, requester_id: RequesterId, slot_id: SlotId) -> Result<RequestId> {
        let mut tx = self.store.begin().await?;
        let slot = load_slot(&mut tx, slot_id).await?;
        let mut requester = load_requester(&mut tx, requester_id).await?;

        if !slot.available {
            return Err(Conflict::SlotUnavailable.into());
        }
        let duplicate = tx
            .list_requests(&RequestFilter::default().requester(requester_id).slot(slot_id))
            .await?
            .iter()
            .any(AnyRequest::is_active);
        if duplicate {
            return Err(Conflict::DuplicateRequest.into());
        }
        self.quota
            .check(&mut tx, requester_id, self.clock.local_today())
            .await?;

        let request = Request::<Pending>::new(
            requester_id,
            slot_id,
            requester.priority_weight(),
            self.clock.now(),
        );
        tx.insert_request(&request).await?;
        requester.record_submission();
        tx.update_requester(&requester).await?;
        tx.commit().await?;

        tracing::info!(
            request_id = %request.data.id,
            priority_weight = request.data.priority_weight,
            "Request submitted"
        );
        Ok(request.data.id)
    }

    /// Withdraws a request. Cancelling an approved request also cancels its
    /// reservation and gives back the quota it used.
    #[instrument(skip_all, fields(requester_id = %requester_id, target = ?target), err)]
    pub async fn cancel(
        &self,
        requester_id: RequesterId,
        target: CancelTarget,
    ) -> Result<RequestId> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let request = match target {
            CancelTarget::Request(id) => tx
                .get_request(id)
                .await?
                .filter(|r| r.data().requester_id == requester_id)
                .ok_or_else(|| FairslotError::not_found("request", id))?,
            CancelTarget::Slot(slot_id) => {
                let mut requests = tx
                    .list_requests(&RequestFilter::default().requester(requester_id).slot(slot_id))
                    .await?;
                let active = requests.iter().rposition(AnyRequest::is_active);
                match active {
                    Some(i) => requests.swap_remove(i),
                    None if requests
                        .iter()
                        .any(|r| r.status() == RequestStatus::Cancelled) =>
                    {
                        return Err(Conflict::AlreadyCancelled.into());
                    }
                    None => {
                        return Err(FairslotError::not_found(
                            "request",
                            format!("for slot {slot_id}"),
                        ));
                    }
                }
            }
        };
        let request_id = request.id();

        match request {
            AnyRequest::Pending(r) => {
                r.cancel(now, &mut tx).await?;
            }
            AnyRequest::Approved(r) => {
                self.release_reservation_of(&mut tx, &r).await?;
                r.cancel(now, &mut tx).await?;
            }
            AnyRequest::Rejected(r) if r.is_queued() => {
                r.cancel(now, &mut tx).await?;
            }
            AnyRequest::Cancelled(_) => return Err(Conflict::AlreadyCancelled.into()),
            // Rejected without a queue position is no longer active
            AnyRequest::Rejected(_) => {
                return Err(FairslotError::not_found("request", request_id));
            }
            AnyRequest::Completed(_) => {
                return Err(FairslotError::InvalidTransition {
                    entity: "request",
                    id: request_id.to_string(),
                    from: "completed",
                    to: "cancelled",
                })
            }
        }

        tx.commit().await?;
        tracing::info!(request_id = %request_id, "Request cancelled");
        Ok(request_id)
    }

    async fn release_reservation_of(
        &self,
        tx: &mut S::Tx,
        request: &Request<Approved>,
    ) -> Result<()> {
        let linked = tx
            .list_reservations(
                &ReservationFilter::default()
                    .requester(request.data.requester_id)
                    .slot(request.data.slot_id),
            )
            .await?
            .into_iter()
            .find(|r| r.request_id == Some(request.data.id));
        let Some(mut reservation) = linked else {
            return Ok(());
        };
        reservation.cancel(self.clock.now())?;
        tx.update_reservation(&reservation).await?;
        self.quota
            .decrement(tx, request.data.requester_id, self.clock.local_today())
            .await?;
        Ok(())
    }

    /// Books an uncontested slot immediately, bypassing allocation.
    #[instrument(skip_all, fields(requester_id = %requester_id, slot_id = %slot_id), err)]
    pub async fn direct_book(
        &self,
        requester_id: RequesterId,
        slot_id: SlotId,
    ) -> Result<ReservationId> {
        let today = self.clock.local_today();
        let mut tx = self.store.begin().await?;
        let slot = load_slot(&mut tx, slot_id).await?;
        load_requester(&mut tx, requester_id).await?;

        if !slot.available {
            return Err(Conflict::SlotUnavailable.into());
        }
        let contested = !tx
            .list_requests(
                &RequestFilter::default()
                    .slot(slot_id)
                    .status(RequestStatus::Pending),
            )
            .await?
            .is_empty();
        if contested {
            return Err(Conflict::PendingContestExists.into());
        }
        self.quota.check(&mut tx, requester_id, today).await?;

        let reservation = Reservation::new(requester_id, slot_id, None, self.clock.now());
        tx.insert_reservation(&reservation).await?;
        tx.set_slot_available(slot_id, false).await?;
        self.quota.increment(&mut tx, requester_id, today).await?;
        tx.commit().await?;

        tracing::info!(reservation_id = %reservation.id, "Slot booked directly");
        Ok(reservation.id)
    }

    /// Cancels one of the requester's reservations. The vacancy is picked up by
    /// the next waitlist promotion run.
    #[instrument(skip_all, fields(requester_id = %requester_id, reservation_id = %reservation_id), err)]
    pub async fn cancel_reservation(
        &self,
        requester_id: RequesterId,
        reservation_id: ReservationId,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut reservation = tx
            .get_reservation(reservation_id)
            .await?
            .filter(|r| r.requester_id == requester_id)
            .ok_or_else(|| FairslotError::not_found("reservation", reservation_id))?;

        reservation.cancel(now)?;
        tx.update_reservation(&reservation).await?;

        if let Some(request_id) = reservation.request_id {
            if let Some(AnyRequest::Approved(request)) = tx.get_request(request_id).await? {
                request.cancel(now, &mut tx).await?;
            }
        }
        self.quota
            .decrement(&mut tx, requester_id, self.clock.local_today())
            .await?;
        tx.commit().await?;

        tracing::info!("Reservation cancelled");
        Ok(())
    }

    /// The requester's requests, newest first.
    #[instrument(skip_all, fields(requester_id = %requester_id), err)]
    pub async fn query_status(&self, requester_id: RequesterId) -> Result<Vec<RequestView>> {
        let mut tx = self.store.begin().await?;
        load_requester(&mut tx, requester_id).await?;
        let requests = tx
            .list_requests(&RequestFilter::default().requester(requester_id))
            .await?;

        let mut slots = SlotCache::default();
        let mut views = Vec::with_capacity(requests.len());
        for request in requests.iter().rev() {
            let slot = slots.get(&mut tx, request.data().slot_id).await?;
            views.push(RequestView::new(request, slot));
        }
        Ok(views)
    }

    /// The requester's reservations, newest first, with reputation totals.
    #[instrument(skip_all, fields(requester_id = %requester_id), err)]
    pub async fn query_records(&self, requester_id: RequesterId) -> Result<RecordsView> {
        let mut tx = self.store.begin().await?;
        let requester = load_requester(&mut tx, requester_id).await?;
        let reservations = tx
            .list_reservations(&ReservationFilter::default().requester(requester_id))
            .await?;

        let mut slots = SlotCache::default();
        let mut views = Vec::with_capacity(reservations.len());
        for reservation in reservations.iter().rev() {
            let slot = slots.get(&mut tx, reservation.slot_id).await?;
            views.push(ReservationView::new(reservation, slot));
        }
        Ok(RecordsView {
            reservations: views,
            stats: (&requester).into(),
        })
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    /// Adds a slot, refusing windows that overlap another slot of the same
    /// resource on the same date.
    #[instrument(skip(self), err)]
    pub async fn register_slot(
        &self,
        resource_id: &str,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<SlotId> {
        validate_window(resource_id, start_time, end_time)?;
        let mut tx = self.store.begin().await?;
        let existing = tx
            .list_slots(&SlotFilter {
                resource_id: Some(resource_id.to_string()),
                date: Some(date),
                from_date: None,
            })
            .await?;
        if existing.iter().any(|s| s.overlaps(start_time, end_time)) {
            return Err(Conflict::SlotOverlap.into());
        }
        let slot = Slot::new(resource_id, date, start_time, end_time, self.clock.now());
        tx.insert_slot(&slot).await?;
        tx.commit().await?;
        Ok(slot.id)
    }

    /// Creates the same daily windows for every date in `from..=to`. Windows
    /// that already exist exactly are skipped; any other overlap fails the
    /// whole batch.
    #[instrument(skip(self, windows), fields(windows = windows.len()), err)]
    pub async fn register_slots_range(
        &self,
        resource_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        windows: &[(NaiveTime, NaiveTime)],
    ) -> Result<Vec<SlotId>> {
        if from > to {
            return Err(FairslotError::Validation(format!(
                "date range is empty: {from} is after {to}"
            )));
        }
        for (start, end) in windows {
            validate_window(resource_id, *start, *end)?;
        }
        for (i, (start, end)) in windows.iter().enumerate() {
            if windows[i + 1..]
                .iter()
                .any(|(s, e)| *s < *end && *start < *e)
            {
                return Err(FairslotError::Validation(format!(
                    "windows overlap each other at {start}-{end}"
                )));
            }
        }

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut created = Vec::new();
        let mut skipped = 0usize;
        for date in from.iter_days().take_while(|d| *d <= to) {
            let existing = tx
                .list_slots(&SlotFilter {
                    resource_id: Some(resource_id.to_string()),
                    date: Some(date),
                    from_date: None,
                })
                .await?;
            for (start, end) in windows {
                if existing
                    .iter()
                    .any(|s| s.start_time == *start && s.end_time == *end)
                {
                    skipped += 1;
                    continue;
                }
                if existing.iter().any(|s| s.overlaps(*start, *end)) {
                    return Err(Conflict::SlotOverlap.into());
                }
                let slot = Slot::new(resource_id, date, *start, *end, now);
                tx.insert_slot(&slot).await?;
                created.push(slot.id);
            }
        }
        tx.commit().await?;

        tracing::info!(created = created.len(), skipped, "Slots registered");
        Ok(created)
    }

    /// Slots from `from_date` (default today) onward with their derived occupancy.
    #[instrument(skip(self), err)]
    pub async fn list_slots(&self, query: SlotQuery) -> Result<Vec<SlotView>> {
        let mut tx = self.store.begin().await?;
        let slots = tx
            .list_slots(&SlotFilter {
                resource_id: query.resource_id,
                date: query.date,
                from_date: Some(query.from_date.unwrap_or_else(|| self.clock.local_today())),
            })
            .await?;

        let mut pending: HashMap<SlotId, usize> = HashMap::new();
        for request in tx
            .list_requests(&RequestFilter::default().status(RequestStatus::Pending))
            .await?
        {
            *pending.entry(request.data().slot_id).or_default() += 1;
        }
        let reserved: HashSet<SlotId> = tx
            .list_reservations(&ReservationFilter::default())
            .await?
            .into_iter()
            .filter(|r| !r.is_cancelled())
            .map(|r| r.slot_id)
            .collect();

        Ok(slots
            .into_iter()
            .map(|slot| {
                let count = pending.get(&slot.id).copied().unwrap_or(0);
                let is_reserved = reserved.contains(&slot.id);
                SlotView::new(slot, is_reserved, count)
            })
            .collect())
    }
}

fn validate_window(resource_id: &str, start: NaiveTime, end: NaiveTime) -> Result<()> {
    if resource_id.trim().is_empty() {
        return Err(FairslotError::Validation(
            "resource_id cannot be empty".to_string(),
        ));
    }
    if start >= end {
        return Err(FairslotError::Validation(format!(
            "slot must end after it starts ({start} >= {end})"
        )));
    }
    Ok(())
}

async fn load_requester<X: Transaction>(tx: &mut X, id: RequesterId) -> Result<Requester> {
    tx.get_requester(id)
        .await?
        .ok_or_else(|| FairslotError::not_found("requester", id))
}

async fn load_slot<X: Transaction>(tx: &mut X, id: SlotId) -> Result<Slot> {
    tx.get_slot(id)
        .await?
        .ok_or_else(|| FairslotError::not_found("slot", id))
}

/// Per-call memo of slots looked up while building views.
#[derive(Default)]
struct SlotCache {
    slots: HashMap<SlotId, Slot>,
}

impl SlotCache {
    async fn get<X: Transaction>(&mut self, tx: &mut X, id: SlotId) -> Result<&Slot> {
        if !self.slots.contains_key(&id) {
            let slot = load_slot(tx, id).await?;
            self.slots.insert(id, slot);
        }
        self.slots
            .get(&id)
            .ok_or_else(|| FairslotError::not_found("slot", id))
    }
}
