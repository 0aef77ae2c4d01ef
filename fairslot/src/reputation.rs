//! No-show detection.
//!
//! A live reservation whose slot window has closed without being cancelled or
//! completed is a no-show. There is no attendance signal; elapsed time is the
//! only criterion. Flagged reservations leave the `Active` state, so a rerun
//! over the same window never penalizes twice.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{FairslotError, Result};
use crate::scheduler::{Job, JobReport};
use crate::store::{ReservationFilter, Store, Transaction};
use crate::types::ReservationStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReputationReport {
    /// Active reservations inspected
    pub scanned: usize,
    pub no_shows: usize,
}

pub struct ReputationTracker<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    penalty: i32,
}

impl<S: Store> ReputationTracker<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            penalty: config.no_show_penalty,
        }
    }

    pub async fn flag_no_shows(&self) -> Result<ReputationReport> {
        let now = self.clock.now();
        let local_now = self.clock.local_now();
        let mut tx = self.store.begin().await?;
        let mut report = ReputationReport::default();

        let active = tx
            .list_reservations(&ReservationFilter::default().status(ReservationStatus::Active))
            .await?;

        for mut reservation in active {
            report.scanned += 1;
            let slot = tx
                .get_slot(reservation.slot_id)
                .await?
                .ok_or_else(|| FairslotError::not_found("slot", reservation.slot_id))?;
            if !slot.has_ended(local_now) {
                continue;
            }

            reservation.mark_no_show(now)?;
            tx.update_reservation(&reservation).await?;

            let mut requester = tx
                .get_requester(reservation.requester_id)
                .await?
                .ok_or_else(|| FairslotError::not_found("requester", reservation.requester_id))?;
            requester.record_no_show(self.penalty);
            tx.update_requester(&requester).await?;
            report.no_shows += 1;

            tracing::debug!(
                reservation_id = %reservation.id,
                requester_id = %requester.id,
                credit_score = requester.credit_score,
                "Reservation flagged as no-show"
            );
        }

        tx.commit().await?;
        Ok(report)
    }
}

#[async_trait]
impl<S: Store + 'static> Job for ReputationTracker<S> {
    fn name(&self) -> &'static str {
        "reputation"
    }

    async fn run_once(&self) -> Result<JobReport> {
        Ok(self.flag_no_shows().await?.into())
    }
}
