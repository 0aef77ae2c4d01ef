//! Waitlist promotion.
//!
//! Each cancelled reservation is a vacancy. A vacancy on a slot that is still
//! marked unavailable goes to the lowest queue position whose requester has
//! weekly quota left; with nobody eligible, the slot is released and its
//! remaining queue is dropped from the waitlist. Either way
//! the cancelled reservation is then deleted, so a vacancy is handled exactly
//! once no matter how often the job runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{FairslotError, Result};
use crate::quota::QuotaTracker;
use crate::request::{Rejected, Request, RequestStatus};
use crate::scheduler::{Job, JobReport};
use crate::store::{RequestFilter, ReservationFilter, Store, Transaction};
use crate::types::{Reservation, ReservationStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaitlistReport {
    /// Cancelled reservations consumed
    pub vacancies: usize,
    pub promoted: usize,
    /// Slots flipped back to available
    pub released: usize,
    /// Vacancies whose slot was already available or already re-filled
    pub unchanged: usize,
    /// Queued requests dropped from the waitlist of a released slot
    pub dequeued: usize,
}

/// What happened to one vacancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Promoted,
    /// Carries the number of queued requests dropped with the release.
    Released(usize),
    Unchanged,
}

pub struct WaitlistPromoter<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    quota: QuotaTracker,
}

impl<S: Store> WaitlistPromoter<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            quota: QuotaTracker::new(config.weekly_quota_max),
        }
    }

    pub async fn promote(&self) -> Result<WaitlistReport> {
        let now = self.clock.now();
        let today = self.clock.local_today();
        let mut tx = self.store.begin().await?;
        let mut report = WaitlistReport::default();

        let cancelled = tx
            .list_reservations(&ReservationFilter::default().status(ReservationStatus::Cancelled))
            .await?;

        for vacancy in cancelled {
            match self.fill(&mut tx, &vacancy, now, today).await? {
                Outcome::Promoted => report.promoted += 1,
                Outcome::Released(dequeued) => {
                    report.released += 1;
                    report.dequeued += dequeued;
                }
                Outcome::Unchanged => report.unchanged += 1,
            }
            tx.delete_reservation(vacancy.id).await?;
            report.vacancies += 1;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn fill(
        &self,
        tx: &mut S::Tx,
        vacancy: &Reservation,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Outcome> {
        let slot_id = vacancy.slot_id;
        let slot = tx
            .get_slot(slot_id)
            .await?
            .ok_or_else(|| FairslotError::not_found("slot", slot_id))?;
        if slot.available {
            return Ok(Outcome::Unchanged);
        }

        let live = tx
            .list_reservations(&ReservationFilter::default().slot(slot_id))
            .await?
            .into_iter()
            .any(|r| !r.is_cancelled());
        if live {
            tracing::debug!(slot_id = %slot_id, "Vacancy already filled");
            return Ok(Outcome::Unchanged);
        }

        let mut queue: Vec<Request<Rejected>> = tx
            .list_requests(
                &RequestFilter::default()
                    .slot(slot_id)
                    .status(RequestStatus::Rejected),
            )
            .await?
            .into_iter()
            .filter_map(|r| r.into_rejected())
            .filter(|r| r.is_queued())
            .collect();
        queue.sort_by_key(|r| r.state.queue_position);

        let mut passed_over = Vec::new();
        for candidate in queue {
            let requester_id = candidate.data.requester_id;
            let mut requester = tx
                .get_requester(requester_id)
                .await?
                .ok_or_else(|| FairslotError::not_found("requester", requester_id))?;
            if !self.quota.has_room(tx, requester_id, today).await? {
                tracing::debug!(
                    request_id = %candidate.data.id,
                    requester_id = %requester_id,
                    "Passing over queued request, requester at weekly quota"
                );
                passed_over.push(candidate);
                continue;
            }

            let approved = candidate.promote(now, tx).await?;
            tx.insert_reservation(&Reservation::new(
                requester_id,
                slot_id,
                Some(approved.data.id),
                now,
            ))
            .await?;

            requester.record_success();
            tx.update_requester(&requester).await?;
            self.quota.increment(tx, requester_id, today).await?;

            tracing::info!(
                slot_id = %slot_id,
                request_id = %approved.data.id,
                requester_id = %requester_id,
                "Promoted queued request into vacated slot"
            );
            return Ok(Outcome::Promoted);
        }

        // A released slot has no waitlist; its former queue may resubmit.
        let dequeued = passed_over.len();
        for request in passed_over {
            request.dequeue(now, tx).await?;
        }
        tx.set_slot_available(slot_id, true).await?;
        tracing::info!(
            slot_id = %slot_id,
            dequeued,
            "No eligible queued requests, slot released"
        );
        Ok(Outcome::Released(dequeued))
    }
}

#[async_trait]
impl<S: Store + 'static> Job for WaitlistPromoter<S> {
    fn name(&self) -> &'static str {
        "waitlist_promotion"
    }

    async fn run_once(&self) -> Result<JobReport> {
        Ok(self.promote().await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::InMemoryStore;
    use crate::types::{Requester, Slot};
    use chrono::NaiveTime;

    async fn setup() -> (Arc<InMemoryStore>, WaitlistPromoter<InMemoryStore>, Requester, Slot) {
        let clock = Arc::new(FixedClock::at_local(
            NaiveDate::from_ymd_opt(2024, 6, 10)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new());
        let requester = Requester::new("alice", 100, clock.now());
        let slot = Slot::new(
            "court-1",
            NaiveDate::from_ymd_opt(2024, 6, 12).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            clock.now(),
        );
        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&requester).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();
        tx.commit().await.unwrap();

        let promoter = WaitlistPromoter::new(store.clone(), clock, &EngineConfig::default());
        (store, promoter, requester, slot)
    }

    async fn cancelled_booking(store: &InMemoryStore, requester: &Requester, slot: &Slot) {
        let mut reservation = Reservation::new(requester.id, slot.id, None, Utc::now());
        reservation.cancel(Utc::now()).unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(&reservation).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_vacancy_on_available_slot_is_consumed_unchanged() {
        let (store, promoter, requester, slot) = setup().await;
        cancelled_booking(&store, &requester, &slot).await;

        let report = promoter.promote().await.unwrap();
        assert_eq!(
            report,
            WaitlistReport {
                vacancies: 1,
                unchanged: 1,
                ..Default::default()
            }
        );

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .list_reservations(&ReservationFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(tx.get_slot(slot.id).await.unwrap().unwrap().available);
    }

    #[tokio::test]
    async fn test_vacancy_on_refilled_slot_is_left_alone() {
        let (store, promoter, requester, slot) = setup().await;
        cancelled_booking(&store, &requester, &slot).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(&Reservation::new(requester.id, slot.id, None, Utc::now()))
            .await
            .unwrap();
        tx.set_slot_available(slot.id, false).await.unwrap();
        tx.commit().await.unwrap();

        let report = promoter.promote().await.unwrap();
        assert_eq!(report.vacancies, 1);
        assert_eq!(report.unchanged, 1);

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.get_slot(slot.id).await.unwrap().unwrap().available);
        assert_eq!(tx.live_reservations_for(slot.id), 1);
    }

    #[tokio::test]
    async fn test_no_vacancies_is_a_no_op() {
        let (_store, promoter, _requester, _slot) = setup().await;
        assert_eq!(promoter.promote().await.unwrap(), WaitlistReport::default());
    }
}
