//! The batch allocation round.
//!
//! Every slot with pending requests is settled in one pass: a winner is drawn
//! by priority weight, the rest are queued on the slot's waitlist in
//! descending priority order. The whole round commits as one transaction, so
//! a failure part-way leaves nothing allocated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{FairslotError, Result};
use crate::quota::QuotaTracker;
use crate::request::{Pending, Request, RequestStatus};
use crate::scheduler::{Job, JobReport};
use crate::store::{RequestFilter, Store, Transaction};
use crate::types::{Reservation, Slot};

/// Outcome of one allocation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationReport {
    /// Slots that had at least one pending request
    pub slots: usize,
    pub approved: usize,
    /// Losers given a queue position
    pub queued: usize,
    /// Requests rejected without a queue position because their slot was gone
    pub invalidated: usize,
    /// Requests rejected without a queue position because their requester hit the weekly quota
    pub over_quota: usize,
}

/// Picks an index by cumulative weight.
///
/// Draws uniformly from `[0, total)` and returns the first index whose running
/// total exceeds the draw. Negative and NaN weights count as zero. When every
/// weight is zero the draw is uniform over all indices. Returns `None` only for
/// an empty slice.
pub fn select_weighted<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let weight = |w: f64| if w.is_nan() { 0.0 } else { w.max(0.0) };
    let total: f64 = weights.iter().copied().map(weight).sum();
    if total <= 0.0 || !total.is_finite() {
        return Some(rng.gen_range(0..weights.len()));
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().copied().enumerate() {
        cumulative += weight(w);
        if cumulative > draw {
            return Some(i);
        }
    }
    // Rounding can leave the draw at the very top of the range.
    weights.iter().rposition(|w| weight(*w) > 0.0)
}

/// Settles contested slots by priority-weighted random draw.
pub struct FairAllocator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    quota: QuotaTracker,
    rng: Mutex<StdRng>,
}

impl<S: Store> FairAllocator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            quota: QuotaTracker::new(config.weekly_quota_max),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replaces the entropy-seeded generator, e.g. with `StdRng::seed_from_u64`.
    pub fn with_rng(self, rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            ..self
        }
    }

    /// Runs one allocation round.
    pub async fn allocate(&self) -> Result<AllocationReport> {
        let now = self.clock.now();
        let today = self.clock.local_today();
        let mut tx = self.store.begin().await?;
        let mut report = AllocationReport::default();

        // Slot rows first, then the pending requests on each locked slot.
        let mut contests = Vec::new();
        for slot in tx.lock_pending_slots().await? {
            let candidates: Vec<Request<Pending>> = tx
                .list_requests(
                    &RequestFilter::default()
                        .slot(slot.id)
                        .status(RequestStatus::Pending),
                )
                .await?
                .into_iter()
                .filter_map(|r| r.into_pending())
                .collect();
            if !candidates.is_empty() {
                contests.push((slot, candidates));
            }
        }
        // Settle slots in first-submission order.
        contests.sort_by_key(|(_, candidates)| {
            (candidates[0].data.applied_at, candidates[0].data.id)
        });

        for (slot, candidates) in contests {
            report.slots += 1;
            self.settle_slot(&mut tx, slot, candidates, now, today, &mut report)
                .await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn settle_slot(
        &self,
        tx: &mut S::Tx,
        slot: Slot,
        candidates: Vec<Request<Pending>>,
        now: DateTime<Utc>,
        today: NaiveDate,
        report: &mut AllocationReport,
    ) -> Result<()> {
        let slot_id = slot.id;
        if !slot.available {
            tracing::debug!(
                slot_id = %slot_id,
                count = candidates.len(),
                "Slot no longer available, invalidating pending requests"
            );
            for request in candidates {
                request.reject(None, now, tx).await?;
                report.invalidated += 1;
            }
            return Ok(());
        }

        let mut eligible = Vec::with_capacity(candidates.len());
        for request in candidates {
            let requester_id = request.data.requester_id;
            // Requester row before its quota counter.
            tx.get_requester(requester_id).await?;
            if self.quota.has_room(tx, requester_id, today).await? {
                eligible.push(request);
            } else {
                tracing::debug!(
                    request_id = %request.data.id,
                    requester_id = %request.data.requester_id,
                    "Requester at weekly quota, rejecting without queue position"
                );
                request.reject(None, now, tx).await?;
                report.over_quota += 1;
            }
        }
        if eligible.is_empty() {
            return Ok(());
        }

        eligible.sort_by(|a, b| {
            b.data
                .priority_weight
                .total_cmp(&a.data.priority_weight)
                .then(a.data.applied_at.cmp(&b.data.applied_at))
        });

        let winner_idx = if eligible.len() == 1 {
            0
        } else {
            let weights: Vec<f64> = eligible.iter().map(|r| r.data.priority_weight).collect();
            let mut rng = self.rng.lock();
            select_weighted(&weights, &mut *rng).unwrap_or(0)
        };
        let winner = eligible.remove(winner_idx);
        let requester_id = winner.data.requester_id;

        let approved = winner.approve(now, tx).await?;
        tx.insert_reservation(&Reservation::new(
            requester_id,
            slot_id,
            Some(approved.data.id),
            now,
        ))
        .await?;
        tx.set_slot_available(slot_id, false).await?;

        let mut requester = tx
            .get_requester(requester_id)
            .await?
            .ok_or_else(|| FairslotError::not_found("requester", requester_id))?;
        requester.record_success();
        tx.update_requester(&requester).await?;
        self.quota.increment(tx, requester_id, today).await?;
        report.approved += 1;

        tracing::debug!(
            slot_id = %slot_id,
            request_id = %approved.data.id,
            requester_id = %requester_id,
            priority_weight = approved.data.priority_weight,
            losers = eligible.len(),
            "Slot allocated"
        );

        for (i, loser) in eligible.into_iter().enumerate() {
            loser.reject(Some(i as u32 + 1), now, tx).await?;
            report.queued += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store + 'static> Job for FairAllocator<S> {
    fn name(&self) -> &'static str {
        "allocation"
    }

    async fn run_once(&self) -> Result<JobReport> {
        Ok(self.allocate().await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_select_weighted_matches_proportions() {
        let weights = [0.6, 0.3, 0.1];
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 20_000;
        let mut wins = [0usize; 3];
        for _ in 0..trials {
            wins[select_weighted(&weights, &mut rng).unwrap()] += 1;
        }
        for (i, w) in weights.iter().enumerate() {
            let observed = wins[i] as f64 / trials as f64;
            assert!(
                (observed - w).abs() < 0.02,
                "index {i}: observed {observed}, expected {w}"
            );
        }
    }

    #[test]
    fn test_select_weighted_zero_total_is_uniform() {
        let weights = [0.0, 0.0, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 20_000;
        let mut wins = [0usize; 4];
        for _ in 0..trials {
            wins[select_weighted(&weights, &mut rng).unwrap()] += 1;
        }
        for count in wins {
            let observed = count as f64 / trials as f64;
            assert!((observed - 0.25).abs() < 0.02, "observed {observed}");
        }
    }

    #[rstest]
    #[case(&[0.0, 1.0, 0.0], 1)]
    #[case(&[-3.0, f64::NAN, 2.0], 2)]
    #[case(&[5.0], 0)]
    fn test_select_weighted_skips_non_positive(#[case] weights: &[f64], #[case] expected: usize) {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(select_weighted(weights, &mut rng), Some(expected));
        }
    }

    #[test]
    fn test_select_weighted_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select_weighted(&[], &mut rng), None);
    }

    #[test]
    fn test_select_weighted_is_reproducible() {
        let weights = [0.8, 0.5, 0.2];
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50)
                .map(|_| select_weighted(&weights, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(99), picks(99));
    }
}
