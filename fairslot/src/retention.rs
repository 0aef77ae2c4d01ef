//! Storage hygiene: prunes ledger rows past the retention horizon.
//!
//! Reservations go first because they may reference requests; quota rows for
//! weeks that started before the horizon go last.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::scheduler::{Job, JobReport};
use crate::store::{Store, Transaction};
use crate::types::week_start;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub reservations_deleted: u64,
    pub requests_deleted: u64,
    pub quotas_deleted: u64,
}

pub struct RetentionJob<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: Store> RetentionJob<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            config: config.clone(),
        }
    }

    pub async fn prune(&self) -> Result<RetentionReport> {
        let horizon = self.config.retention_horizon()?;
        let cutoff = self.clock.now() - horizon;
        let quota_cutoff = week_start(self.clock.local_today() - horizon);

        let mut tx = self.store.begin().await?;
        let reservations_deleted = tx.delete_reservations_expired(cutoff).await?;
        let requests_deleted = tx.delete_requests_applied_before(cutoff).await?;
        let quotas_deleted = tx.delete_quotas_before(quota_cutoff).await?;
        tx.commit().await?;

        Ok(RetentionReport {
            reservations_deleted,
            requests_deleted,
            quotas_deleted,
        })
    }
}

#[async_trait]
impl<S: Store + 'static> Job for RetentionJob<S> {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn run_once(&self) -> Result<JobReport> {
        Ok(self.prune().await?.into())
    }
}
