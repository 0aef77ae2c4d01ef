//! Fair allocation engine for contested, time-boxed shared slots.
//!
//! Requesters submit requests for slots. A nightly allocation run settles each
//! contested slot with a weighted random draw, biased by the requester's
//! credit score and track record, and queues the losers in ranked order. When
//! a reservation is cancelled, the waitlist job hands the slot to the next
//! eligible queued request. Reservations whose window passes without being
//! cancelled count as no-shows and cost the requester credit.
//!
//! This crate provides:
//! - [`RequestLedger`]: per-requester operations (submit, cancel, direct booking, queries)
//! - [`FairAllocator`], [`WaitlistPromoter`], [`ReputationTracker`], [`RetentionJob`]: batch jobs
//! - [`JobScheduler`]: runs the jobs on wall-clock cadences with at most one run per job in flight
//! - [`Store`]: transactional storage, with in-memory and PostgreSQL backends
//!
//! # Example
//! ```ignore
//! use fairslot::{Engine, EngineConfig, InMemoryStore};
//!
//! let engine = Engine::new(Arc::new(InMemoryStore::new()), EngineConfig::default())?;
//! let ledger = engine.ledger();
//!
//! let alice = ledger.register_requester("alice").await?;
//! let slot = ledger.register_slot("court-1", date, start, end).await?;
//! ledger.submit(alice, slot).await?;
//!
//! // Settle every slot with pending requests
//! let report = engine.allocator().allocate().await?;
//! ```

pub mod allocation;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod quota;
pub mod reputation;
pub mod request;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod views;
pub mod waitlist;

// Re-export commonly used types
pub use allocation::{AllocationReport, FairAllocator};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Conflict, ErrorKind, FairslotError, Result};
pub use ledger::{CancelTarget, RequestLedger, SlotQuery};
pub use quota::QuotaTracker;
pub use reputation::{ReputationReport, ReputationTracker};
pub use request::{AnyRequest, RequestStatus};
pub use retention::{RetentionJob, RetentionReport};
pub use scheduler::{Cadence, Job, JobReport, JobScheduler, ScheduleConfig, TriggerOutcome};
pub use store::{InMemoryStore, Store, Transaction};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use types::{
    Requester, RequesterId, RequestId, Reservation, ReservationId, ReservationStatus, Slot, SlotId,
    WeeklyQuota,
};
pub use views::{
    CreditView, RecordStatus, RecordsView, ReputationStats, RequestView, ReservationView,
    SlotAvailability, SlotView,
};
pub use waitlist::{WaitlistPromoter, WaitlistReport};

/// Embedded schema migrations for [`PostgresStore`].
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
