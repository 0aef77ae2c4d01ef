use chrono::{DateTime, Utc};

use crate::error::{FairslotError, Result};
use crate::store::Transaction;

use super::types::{Approved, Cancelled, Pending, Rejected, Request, RequestState};

impl Request<Pending> {
    /// Winner of an allocation round.
    pub async fn approve<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Approved>> {
        let request = Request {
            data: self.data,
            state: Approved { processed_at: now },
        };
        tx.persist_request(&request).await?;
        Ok(request)
    }

    /// Loser of an allocation round. `None` invalidates the request instead of
    /// queueing it.
    pub async fn reject<X: Transaction>(
        self,
        queue_position: Option<u32>,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Rejected>> {
        let request = Request {
            data: self.data,
            state: Rejected {
                processed_at: now,
                queue_position,
            },
        };
        tx.persist_request(&request).await?;
        Ok(request)
    }

    pub async fn cancel<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Cancelled>> {
        cancel(self, now, tx).await
    }
}

impl Request<Approved> {
    /// The caller is responsible for releasing the linked reservation.
    pub async fn cancel<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Cancelled>> {
        cancel(self, now, tx).await
    }
}

impl Request<Rejected> {
    /// Moves a waitlisted request into the vacated slot.
    pub async fn promote<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Approved>> {
        if !self.is_queued() {
            return Err(FairslotError::InvalidTransition {
                entity: "request",
                id: self.data.id.to_string(),
                from: "rejected",
                to: "approved",
            });
        }
        let request = Request {
            data: self.data,
            state: Approved { processed_at: now },
        };
        tx.persist_request(&request).await?;
        Ok(request)
    }

    /// Drops the request from the waitlist without cancelling it. The request
    /// is no longer active afterwards.
    pub async fn dequeue<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Rejected>> {
        if !self.is_queued() {
            return Err(FairslotError::InvalidTransition {
                entity: "request",
                id: self.data.id.to_string(),
                from: "rejected",
                to: "rejected",
            });
        }
        let request = Request {
            data: self.data,
            state: Rejected {
                processed_at: now,
                queue_position: None,
            },
        };
        tx.persist_request(&request).await?;
        Ok(request)
    }

    /// Leaves the waitlist. Only queued requests are still active.
    pub async fn cancel<X: Transaction>(
        self,
        now: DateTime<Utc>,
        tx: &mut X,
    ) -> Result<Request<Cancelled>> {
        if !self.is_queued() {
            return Err(FairslotError::InvalidTransition {
                entity: "request",
                id: self.data.id.to_string(),
                from: "rejected",
                to: "cancelled",
            });
        }
        cancel(self, now, tx).await
    }
}

async fn cancel<T, X>(
    request: Request<T>,
    now: DateTime<Utc>,
    tx: &mut X,
) -> Result<Request<Cancelled>>
where
    T: RequestState,
    X: Transaction,
{
    let request = Request {
        data: request.data,
        state: Cancelled { processed_at: now },
    };
    tx.persist_request(&request).await?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AnyRequest, RequestStatus};
    use crate::store::{InMemoryStore, Store};
    use crate::types::{Requester, Slot};
    use chrono::{NaiveDate, NaiveTime};

    async fn seeded(store: &InMemoryStore) -> Request<Pending> {
        let now = Utc::now();
        let requester = Requester::new("alice", 100, now);
        let slot = Slot::new(
            "court-1",
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            now,
        );
        let request = Request::<Pending>::new(requester.id, slot.id, 0.5, now);
        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&requester).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();
        tx.insert_request(&request).await.unwrap();
        tx.commit().await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_transitions_persist() {
        let store = InMemoryStore::new();
        let request = seeded(&store).await;
        let id = request.data.id;
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let rejected = request.reject(Some(1), now, &mut tx).await.unwrap();
        let approved = rejected.promote(now, &mut tx).await.unwrap();
        approved.cancel(now, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = tx.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RequestStatus::Cancelled);
        assert_eq!(stored.processed_at(), Some(now));
    }

    #[tokio::test]
    async fn test_unqueued_rejection_cannot_be_promoted() {
        let store = InMemoryStore::new();
        let request = seeded(&store).await;
        let id = request.data.id;
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let rejected = request.reject(None, now, &mut tx).await.unwrap();
        let err = rejected.clone().promote(now, &mut tx).await.unwrap_err();
        assert!(matches!(err, FairslotError::InvalidTransition { .. }));
        let err = rejected.cancel(now, &mut tx).await.unwrap_err();
        assert!(matches!(err, FairslotError::InvalidTransition { .. }));

        let stored = tx.get_request(id).await.unwrap().unwrap();
        assert!(matches!(stored, AnyRequest::Rejected(_)));
        assert!(!stored.is_active());
    }

    #[tokio::test]
    async fn test_dequeue_leaves_request_inactive() {
        let store = InMemoryStore::new();
        let request = seeded(&store).await;
        let id = request.data.id;
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let queued = request.reject(Some(2), now, &mut tx).await.unwrap();
        let dequeued = queued.dequeue(now, &mut tx).await.unwrap();
        assert!(!dequeued.is_queued());

        let err = dequeued.dequeue(now, &mut tx).await.unwrap_err();
        assert!(matches!(err, FairslotError::InvalidTransition { .. }));

        let stored = tx.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RequestStatus::Rejected);
        assert!(!stored.is_active());
    }
}
