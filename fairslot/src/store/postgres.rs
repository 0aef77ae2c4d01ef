//! PostgreSQL store.
//!
//! Each [`Transaction`] wraps a database transaction. Rows read through
//! `get_*`/`list_*` are locked with `FOR UPDATE`, which serializes
//! concurrent ledger operations and job runs on the rows they touch. The
//! schema (see `migrations/`) carries the same constraints the in-memory
//! store checks by hand; violations of the uniqueness indexes surface as
//! conflicts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::error::{Conflict, FairslotError, Result};
use crate::request::{AnyRequest, Pending, Request, RequestData, RequestState, RequestStatus};
use crate::types::{
    RequestId, Requester, RequesterId, Reservation, ReservationId, ReservationStatus, Slot, SlotId,
    WeeklyQuota,
};

use super::{RequestFilter, ReservationFilter, SlotFilter, Store, Transaction};

const REQUEST_COLUMNS: &str = "id, requester_id, slot_id, status, priority_weight, queue_position, applied_at, processed_at";
const RESERVATION_COLUMNS: &str = "id, requester_id, slot_id, request_id, status, created_at, cancelled_at, no_show_at, rating, feedback";
const SLOT_COLUMNS: &str = "id, resource_id, date, start_time, end_time, available, created_at";
const REQUESTER_COLUMNS: &str =
    "id, name, credit_score, total_requests, successful_requests, no_show_count, created_at";

/// PostgreSQL implementation of [`Store`].
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/fairslot").await?;
/// fairslot::migrator().run(&pool).await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTransaction { tx })
    }
}

pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

/// Maps violations of the partial unique indexes onto their conflicts.
fn map_write_err(e: sqlx::Error) -> FairslotError {
    if let sqlx::Error::Database(db) = &e {
        match db.constraint() {
            Some("reservations_one_live_per_slot") => {
                return Conflict::ActiveReservationExists.into()
            }
            Some("requests_one_active_per_requester_slot") => {
                return Conflict::DuplicateRequest.into()
            }
            _ => {}
        }
    }
    FairslotError::Database(e)
}

fn ensure_affected(rows: u64, resource: &'static str, id: impl ToString) -> Result<()> {
    if rows == 0 {
        return Err(FairslotError::not_found(resource, id));
    }
    Ok(())
}

fn requester_from_row(row: &PgRow) -> Result<Requester> {
    Ok(Requester {
        id: RequesterId(row.try_get("id")?),
        name: row.try_get("name")?,
        credit_score: row.try_get("credit_score")?,
        total_requests: row.try_get("total_requests")?,
        successful_requests: row.try_get("successful_requests")?,
        no_show_count: row.try_get("no_show_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<Slot> {
    Ok(Slot {
        id: SlotId(row.try_get("id")?),
        resource_id: row.try_get("resource_id")?,
        date: row.try_get("date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        available: row.try_get("available")?,
        created_at: row.try_get("created_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<AnyRequest> {
    let data = RequestData {
        id: RequestId(row.try_get("id")?),
        requester_id: RequesterId(row.try_get("requester_id")?),
        slot_id: SlotId(row.try_get("slot_id")?),
        priority_weight: row.try_get("priority_weight")?,
        applied_at: row.try_get("applied_at")?,
    };
    let status: String = row.try_get("status")?;
    let queue_position = row
        .try_get::<Option<i32>, _>("queue_position")?
        .map(u32::try_from)
        .transpose()
        .map_err(|e| FairslotError::Other(anyhow::anyhow!("bad queue_position: {e}")))?;
    AnyRequest::from_parts(
        data,
        status.parse()?,
        queue_position,
        row.try_get("processed_at")?,
    )
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    let status: String = row.try_get("status")?;
    Ok(Reservation {
        id: ReservationId(row.try_get("id")?),
        requester_id: RequesterId(row.try_get("requester_id")?),
        slot_id: SlotId(row.try_get("slot_id")?),
        request_id: row.try_get::<Option<Uuid>, _>("request_id")?.map(RequestId),
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        no_show_at: row.try_get("no_show_at")?,
        rating: row.try_get("rating")?,
        feedback: row.try_get("feedback")?,
    })
}

fn status_columns(request: &AnyRequest) -> (RequestStatus, Option<i32>, Option<DateTime<Utc>>) {
    (
        request.status(),
        request.queue_position().map(|p| p as i32),
        request.processed_at(),
    )
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn insert_requester(&mut self, requester: &Requester) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requesters (id, name, credit_score, total_requests, successful_requests, no_show_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*requester.id)
        .bind(&requester.name)
        .bind(requester.credit_score)
        .bind(requester.total_requests)
        .bind(requester.successful_requests)
        .bind(requester.no_show_count)
        .bind(requester.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_requester(&mut self, id: RequesterId) -> Result<Option<Requester>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUESTER_COLUMNS} FROM requesters WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(requester_from_row).transpose()
    }

    async fn update_requester(&mut self, requester: &Requester) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE requesters SET
                name = $2,
                credit_score = $3,
                total_requests = $4,
                successful_requests = $5,
                no_show_count = $6
            WHERE id = $1
            "#,
        )
        .bind(*requester.id)
        .bind(&requester.name)
        .bind(requester.credit_score)
        .bind(requester.total_requests)
        .bind(requester.successful_requests)
        .bind(requester.no_show_count)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        ensure_affected(rows, "requester", requester.id)
    }

    async fn insert_slot(&mut self, slot: &Slot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO slots (id, resource_id, date, start_time, end_time, available, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*slot.id)
        .bind(&slot.resource_id)
        .bind(slot.date)
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.available)
        .bind(slot.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_slot(&mut self, id: SlotId) -> Result<Option<Slot>> {
        let row = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM slots WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(slot_from_row).transpose()
    }

    async fn set_slot_available(&mut self, id: SlotId, available: bool) -> Result<()> {
        let rows = sqlx::query("UPDATE slots SET available = $2 WHERE id = $1")
            .bind(*id)
            .bind(available)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        ensure_affected(rows, "slot", id)
    }

    async fn list_slots(&mut self, filter: &SlotFilter) -> Result<Vec<Slot>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SLOT_COLUMNS} FROM slots
            WHERE ($1::text IS NULL OR resource_id = $1)
              AND ($2::date IS NULL OR date = $2)
              AND ($3::date IS NULL OR date >= $3)
            ORDER BY date, start_time, resource_id
            FOR UPDATE
            "#
        ))
        .bind(filter.resource_id.as_deref())
        .bind(filter.date)
        .bind(filter.from_date)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn lock_pending_slots(&mut self) -> Result<Vec<Slot>> {
        // Row locks are taken in ORDER BY order.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SLOT_COLUMNS} FROM slots
            WHERE id IN (SELECT slot_id FROM requests WHERE status = 'pending')
            ORDER BY id
            FOR UPDATE
            "#
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn insert_request(&mut self, request: &Request<Pending>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, requester_id, slot_id, status, priority_weight, applied_at)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            "#,
        )
        .bind(*request.data.id)
        .bind(*request.data.requester_id)
        .bind(*request.data.slot_id)
        .bind(request.data.priority_weight)
        .bind(request.data.applied_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn persist_request<T: RequestState + Clone>(
        &mut self,
        request: &Request<T>,
    ) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let any_request = AnyRequest::from(request.clone());
        let (status, queue_position, processed_at) = status_columns(&any_request);
        let rows = sqlx::query(
            r#"
            UPDATE requests SET
                status = $2,
                queue_position = $3,
                processed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(*any_request.id())
        .bind(status.as_str())
        .bind(queue_position)
        .bind(processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?
        .rows_affected();
        ensure_affected(rows, "request", any_request.id())
    }

    async fn get_request(&mut self, id: RequestId) -> Result<Option<AnyRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_requests(&mut self, filter: &RequestFilter) -> Result<Vec<AnyRequest>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM requests
            WHERE ($1::uuid IS NULL OR requester_id = $1)
              AND ($2::uuid IS NULL OR slot_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY applied_at, id
            FOR UPDATE
            "#
        ))
        .bind(filter.requester_id.map(|id| id.0))
        .bind(filter.slot_id.map(|id| id.0))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn delete_requests_applied_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM requests WHERE applied_at < $1")
            .bind(cutoff)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, requester_id, slot_id, request_id, status, created_at, cancelled_at, no_show_at, rating, feedback)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(*reservation.id)
        .bind(*reservation.requester_id)
        .bind(*reservation.slot_id)
        .bind(reservation.request_id.map(|id| id.0))
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.cancelled_at)
        .bind(reservation.no_show_at)
        .bind(reservation.rating)
        .bind(&reservation.feedback)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE reservations SET
                status = $2,
                cancelled_at = $3,
                no_show_at = $4,
                rating = $5,
                feedback = $6
            WHERE id = $1
            "#,
        )
        .bind(*reservation.id)
        .bind(reservation.status.as_str())
        .bind(reservation.cancelled_at)
        .bind(reservation.no_show_at)
        .bind(reservation.rating)
        .bind(&reservation.feedback)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?
        .rows_affected();
        ensure_affected(rows, "reservation", reservation.id)
    }

    async fn get_reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn list_reservations(
        &mut self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM reservations
            WHERE ($1::uuid IS NULL OR requester_id = $1)
              AND ($2::uuid IS NULL OR slot_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at, id
            FOR UPDATE
            "#
        ))
        .bind(filter.requester_id.map(|id| id.0))
        .bind(filter.slot_id.map(|id| id.0))
        .bind(filter.status.map(|s: ReservationStatus| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn delete_reservation(&mut self, id: ReservationId) -> Result<()> {
        let rows = sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(*id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        ensure_affected(rows, "reservation", id)
    }

    async fn delete_reservations_expired(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            DELETE FROM reservations
            WHERE created_at < $1
               OR request_id IN (SELECT id FROM requests WHERE applied_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn get_quota(
        &mut self,
        requester_id: RequesterId,
        week_start: NaiveDate,
    ) -> Result<Option<WeeklyQuota>> {
        let row = sqlx::query(
            r#"
            SELECT requester_id, week_start, count FROM weekly_quotas
            WHERE requester_id = $1 AND week_start = $2
            FOR UPDATE
            "#,
        )
        .bind(*requester_id)
        .bind(week_start)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| -> Result<WeeklyQuota> {
            Ok(WeeklyQuota {
                requester_id: RequesterId(row.try_get("requester_id")?),
                week_start: row.try_get("week_start")?,
                count: row.try_get("count")?,
            })
        })
        .transpose()
    }

    async fn put_quota(&mut self, quota: &WeeklyQuota) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO weekly_quotas (requester_id, week_start, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (requester_id, week_start) DO UPDATE SET count = EXCLUDED.count
            "#,
        )
        .bind(*quota.requester_id)
        .bind(quota.week_start)
        .bind(quota.count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_quotas_before(&mut self, week_start: NaiveDate) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM weekly_quotas WHERE week_start < $1")
            .bind(week_start)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn slot() -> Slot {
        Slot::new(
            "court-1",
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            Utc::now(),
        )
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_round_trip_rows(pool: PgPool) {
        let store = PostgresStore::new(pool);
        let now = Utc::now();
        let requester = Requester::new("alice", 100, now);
        let slot = slot();
        let request = Request::<Pending>::new(requester.id, slot.id, 0.5, now);
        let id = request.data.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&requester).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();
        tx.insert_request(&request).await.unwrap();
        request.reject(Some(1), now, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = tx.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RequestStatus::Rejected);
        assert_eq!(stored.queue_position(), Some(1));
        assert_eq!(tx.get_slot(slot.id).await.unwrap().unwrap().date, slot.date);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_partial_unique_index_maps_to_conflict(pool: PgPool) {
        let store = PostgresStore::new(pool);
        let now = Utc::now();
        let alice = Requester::new("alice", 100, now);
        let bob = Requester::new("bob", 100, now);
        let slot = slot();

        let mut tx = store.begin().await.unwrap();
        tx.insert_requester(&alice).await.unwrap();
        tx.insert_requester(&bob).await.unwrap();
        tx.insert_slot(&slot).await.unwrap();
        tx.insert_reservation(&Reservation::new(alice.id, slot.id, None, now))
            .await
            .unwrap();
        let err = tx
            .insert_reservation(&Reservation::new(bob.id, slot.id, None, now))
            .await
            .unwrap_err();
        assert_eq!(err.conflict(), Some(Conflict::ActiveReservationExists));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[test_log::test]
    async fn test_allocation_and_direct_booking_serialize_on_slots(pool: PgPool) {
        use crate::config::EngineConfig;
        use crate::engine::Engine;
        use crate::error::ErrorKind;
        use std::sync::Arc;

        let store = Arc::new(PostgresStore::new(pool));
        let engine = Engine::new(store, EngineConfig::default()).unwrap();
        let ledger = engine.ledger();
        let date = NaiveDate::from_ymd_opt(2030, 6, 12).unwrap();

        let mut slots = Vec::new();
        let mut requesters = Vec::new();
        let mut tx = engine.store().begin().await.unwrap();
        for i in 0..17 {
            let requester = Requester::new(format!("requester-{i}"), 100, Utc::now());
            tx.insert_requester(&requester).await.unwrap();
            requesters.push(requester.id);
        }
        tx.commit().await.unwrap();

        for (i, pair) in requesters[..16].chunks(2).enumerate() {
            let slot = ledger
                .register_slot(
                    &format!("court-{i}"),
                    date,
                    NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
                )
                .await
                .unwrap();
            for requester in pair {
                ledger.submit(*requester, slot).await.unwrap();
            }
            slots.push(slot);
        }
        let walk_in = requesters[16];

        // Direct bookings walk the slots in reverse while the round runs.
        let allocator = engine.allocator();
        let (report, bookings) = tokio::join!(allocator.allocate(), async {
            let mut results = Vec::new();
            for slot in slots.iter().rev() {
                results.push(ledger.direct_book(walk_in, *slot).await);
            }
            results
        });

        let report = report.unwrap();
        assert_eq!(report.slots, 8);
        assert_eq!(report.approved, 8);
        for booking in bookings {
            assert_eq!(booking.unwrap_err().kind(), ErrorKind::Conflict);
        }
    }
}
