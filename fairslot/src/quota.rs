//! Weekly reservation quotas.
//!
//! Counters are keyed by requester and the Monday of the local calendar week
//! in which the reservation was gained. Rows are created lazily on first use.
//! The count stays within `0..=max`.

use chrono::NaiveDate;

use crate::error::{Conflict, Result};
use crate::store::Transaction;
use crate::types::{week_start, RequesterId, WeeklyQuota};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTracker {
    max: i32,
}

impl QuotaTracker {
    pub fn new(max: i32) -> Self {
        Self { max: max.max(0) }
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    /// Reservations counted against the week containing `today`.
    pub async fn used<X: Transaction>(
        &self,
        tx: &mut X,
        requester_id: RequesterId,
        today: NaiveDate,
    ) -> Result<i32> {
        Ok(tx
            .get_quota(requester_id, week_start(today))
            .await?
            .map_or(0, |q| q.count))
    }

    pub async fn has_room<X: Transaction>(
        &self,
        tx: &mut X,
        requester_id: RequesterId,
        today: NaiveDate,
    ) -> Result<bool> {
        Ok(self.used(tx, requester_id, today).await? < self.max)
    }

    /// Fails with `QuotaExceeded` when the week's count has reached the max.
    pub async fn check<X: Transaction>(
        &self,
        tx: &mut X,
        requester_id: RequesterId,
        today: NaiveDate,
    ) -> Result<()> {
        if self.has_room(tx, requester_id, today).await? {
            Ok(())
        } else {
            Err(Conflict::QuotaExceeded.into())
        }
    }

    /// Counts one more reservation. Never pushes the count past the max.
    pub async fn increment<X: Transaction>(
        &self,
        tx: &mut X,
        requester_id: RequesterId,
        today: NaiveDate,
    ) -> Result<WeeklyQuota> {
        let week = week_start(today);
        let mut quota = tx
            .get_quota(requester_id, week)
            .await?
            .unwrap_or_else(|| WeeklyQuota::empty(requester_id, week));
        if quota.count >= self.max {
            return Err(Conflict::QuotaExceeded.into());
        }
        quota.count += 1;
        tx.put_quota(&quota).await?;
        tracing::debug!(
            requester_id = %requester_id,
            week_start = %week,
            count = quota.count,
            "Weekly quota incremented"
        );
        Ok(quota)
    }

    /// Releases one reservation. Never drops the count below zero.
    pub async fn decrement<X: Transaction>(
        &self,
        tx: &mut X,
        requester_id: RequesterId,
        today: NaiveDate,
    ) -> Result<WeeklyQuota> {
        let week = week_start(today);
        let mut quota = tx
            .get_quota(requester_id, week)
            .await?
            .unwrap_or_else(|| WeeklyQuota::empty(requester_id, week));
        if quota.count > 0 {
            quota.count -= 1;
            tx.put_quota(&quota).await?;
        }
        tracing::debug!(
            requester_id = %requester_id,
            week_start = %week,
            count = quota.count,
            "Weekly quota decremented"
        );
        Ok(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Store};
    use crate::types::Requester;
    use chrono::Utc;

    #[tokio::test]
    async fn test_quota_bounds() {
        let store = InMemoryStore::new();
        let requester = Requester::new("alice", 100, Utc::now());
        let tracker = QuotaTracker::new(2);
        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let thursday = NaiveDate::from_ymd_opt(2024, 6, 13).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&requester).await.unwrap();

        // Decrement on a fresh week stays at zero
        let quota = tracker.decrement(&mut tx, requester.id, monday).await.unwrap();
        assert_eq!(quota.count, 0);

        tracker.increment(&mut tx, requester.id, monday).await.unwrap();
        let quota = tracker
            .increment(&mut tx, requester.id, thursday)
            .await
            .unwrap();
        assert_eq!(quota.count, 2);
        assert_eq!(quota.week_start, monday);

        let err = tracker
            .increment(&mut tx, requester.id, thursday)
            .await
            .unwrap_err();
        assert_eq!(err.conflict(), Some(Conflict::QuotaExceeded));
        assert!(tracker.check(&mut tx, requester.id, monday).await.is_err());
        assert_eq!(tracker.used(&mut tx, requester.id, monday).await.unwrap(), 2);

        // Next week is a fresh counter
        let next_week = NaiveDate::from_ymd_opt(2024, 6, 17).unwrap();
        tracker.check(&mut tx, requester.id, next_week).await.unwrap();

        tracker.decrement(&mut tx, requester.id, monday).await.unwrap();
        tracker.check(&mut tx, requester.id, monday).await.unwrap();
    }
}
