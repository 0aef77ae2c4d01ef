//! Wires a store, a clock and the engine configuration into the ledger and the
//! four batch jobs.

use std::sync::Arc;

use crate::allocation::FairAllocator;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::RequestLedger;
use crate::reputation::ReputationTracker;
use crate::retention::RetentionJob;
use crate::scheduler::{JobScheduler, ScheduleConfig};
use crate::store::Store;
use crate::waitlist::WaitlistPromoter;

pub struct Engine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: Store + 'static> Engine<S> {
    /// Builds an engine on the system clock.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> RequestLedger<S> {
        RequestLedger::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    pub fn allocator(&self) -> FairAllocator<S> {
        FairAllocator::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    pub fn waitlist(&self) -> WaitlistPromoter<S> {
        WaitlistPromoter::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    pub fn reputation(&self) -> ReputationTracker<S> {
        ReputationTracker::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    pub fn retention(&self) -> RetentionJob<S> {
        RetentionJob::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    /// A scheduler with all four jobs registered on the given cadences.
    pub fn scheduler(&self, schedule: &ScheduleConfig) -> Result<JobScheduler> {
        schedule.validate()?;
        let mut scheduler = JobScheduler::new(self.clock.clone());
        scheduler
            .register(Arc::new(self.allocator()), schedule.allocation)?
            .register(Arc::new(self.waitlist()), schedule.waitlist)?
            .register(Arc::new(self.reputation()), schedule.reputation)?
            .register(Arc::new(self.retention()), schedule.retention)?;
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::InMemoryStore;

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            weekly_quota_max: 0,
            ..Default::default()
        };
        let err = Engine::new(Arc::new(InMemoryStore::new()), config)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_scheduler_registers_every_job() {
        let engine = Engine::new(Arc::new(InMemoryStore::new()), EngineConfig::default()).unwrap();
        let scheduler = engine.scheduler(&ScheduleConfig::default()).unwrap();
        assert_eq!(
            scheduler.job_names(),
            vec!["allocation", "waitlist_promotion", "reputation", "retention"]
        );
    }
}
