//! Service runner for the fairslot allocation engine.
//!
//! Loads configuration, opens the ledger (in memory or PostgreSQL, running migrations), and drives
//! the four engine jobs on their wall-clock cadences until shutdown. With PostgreSQL storage and
//! leader election enabled, only the replica holding the advisory lock runs the scheduler; the
//! others wait to take over.
//!
//! # Example
//! ```no_run
//! use slotctl::{Application, Config};
//!
//! # async fn run(config: Config) -> anyhow::Result<()> {
//! let app = Application::new(config).await?;
//! app.serve(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use fairslot::{Engine, InMemoryStore, JobReport, JobScheduler, PostgresStore, TriggerOutcome};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LeaderElectionConfig, PoolSettings, StorageConfig};

pub mod config;
pub mod leader_election;
pub mod telemetry;

pub use config::Config;

enum Backend {
    Memory(Engine<InMemoryStore>),
    Postgres {
        engine: Engine<PostgresStore>,
        pool: PgPool,
    },
}

/// Owns the engine, its storage and the scheduler lifecycle.
///
/// 1. **Create**: [`Application::new`] connects storage and runs migrations
/// 2. **Serve**: [`Application::serve`] runs the scheduler (on the leader) until shutdown
/// 3. **Shutdown**: in-flight job runs finish, then connections and telemetry are closed
pub struct Application {
    config: Config,
    backend: Backend,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting slotctl with configuration: {:#?}", config);

        let backend = match &config.storage {
            StorageConfig::Memory => {
                tracing::warn!("Using in-memory storage; the ledger is lost on exit");
                Backend::Memory(Engine::new(Arc::new(InMemoryStore::new()), config.engine.clone())?)
            }
            StorageConfig::Postgres { url, pool: settings } => {
                let pool = connect(url, settings).await?;
                fairslot::migrator().run(&pool).await?;
                info!("Database migrations applied");
                let store = Arc::new(PostgresStore::new(pool.clone()));
                Backend::Postgres {
                    engine: Engine::new(store, config.engine.clone())?,
                    pool,
                }
            }
        };

        Ok(Self { config, backend })
    }

    fn scheduler(&self) -> fairslot::Result<JobScheduler> {
        match &self.backend {
            Backend::Memory(engine) => engine.scheduler(&self.config.schedule),
            Backend::Postgres { engine, .. } => engine.scheduler(&self.config.schedule),
        }
    }

    /// Runs one job to completion, outside its cadence.
    pub async fn run_once(&self, job: &str) -> anyhow::Result<JobReport> {
        let scheduler = self.scheduler()?;
        match scheduler.trigger(job)? {
            TriggerOutcome::Started(handle) => Ok(handle.await??),
            TriggerOutcome::SkippedAlreadyRunning => anyhow::bail!("job '{job}' is already running"),
        }
    }

    /// Drives the scheduler until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let scheduler = Arc::new(self.scheduler()?);

        let (driver, pool): (JoinHandle<()>, Option<PgPool>) = match self.backend {
            Backend::Memory(_) => (spawn_scheduler(scheduler, token.clone()), None),
            Backend::Postgres { pool, .. } if self.config.leader_election.enabled => {
                let task = lead_when_elected(
                    pool.clone(),
                    self.config.leader_election.clone(),
                    scheduler,
                    token.clone(),
                );
                (tokio::spawn(task), Some(pool))
            }
            Backend::Postgres { pool, .. } => {
                info!("Leader election disabled, running scheduler on this instance");
                (spawn_scheduler(scheduler, token.clone()), Some(pool))
            }
        };

        shutdown.await;
        info!("Stopping scheduler, waiting for in-flight jobs...");
        token.cancel();
        driver.await?;

        if let Some(pool) = pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();
        Ok(())
    }
}

async fn connect(url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let nonzero = |d: std::time::Duration| (!d.is_zero()).then_some(d);
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(nonzero(settings.idle_timeout))
        .max_lifetime(nonzero(settings.max_lifetime))
        .connect(url)
        .await?;
    Ok(pool)
}

fn spawn_scheduler(scheduler: Arc<JobScheduler>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { scheduler.run(token).await })
}

/// Competes for leadership and runs the scheduler for as long as this replica leads.
async fn lead_when_elected(
    pool: PgPool,
    config: LeaderElectionConfig,
    scheduler: Arc<JobScheduler>,
    shutdown: CancellationToken,
) {
    let session: Arc<tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>> = Default::default();
    let is_leader = Arc::new(AtomicBool::new(false));

    let on_gain = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        move || {
            let session = session.clone();
            let token = shutdown.child_token();
            let handle = spawn_scheduler(scheduler.clone(), token.clone());
            async move {
                *session.lock().await = Some((token, handle));
                info!("Job scheduler started on elected leader");
                Ok::<_, anyhow::Error>(())
            }
        }
    };

    let on_lose = {
        let session = session.clone();
        move || {
            let session = session.clone();
            async move {
                let current = session.lock().await.take();
                if let Some((token, handle)) = current {
                    token.cancel();
                    handle.await?;
                    info!("Job scheduler stopped on this replica");
                }
                Ok::<_, anyhow::Error>(())
            }
        }
    };

    leader_election::leader_election_task(pool, config, is_leader, shutdown, on_gain, on_lose).await;
}
