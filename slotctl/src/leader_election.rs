use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::LeaderElectionConfig;

/// Keeps this replica competing for scheduler leadership until `shutdown` fires.
///
/// Leadership is a PostgreSQL session-level advisory lock, so the connection that took it is held
/// for as long as we lead. If that connection dies the lock is gone and we step down. On shutdown
/// the lock is released explicitly before the connection goes back to the pool.
#[instrument(skip_all, fields(lock_id = config.lock_id))]
pub async fn leader_election_task<F1, F2, Fut1, Fut2>(
    pool: PgPool,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
    shutdown: CancellationToken,
    on_gain_leadership: F1,
    on_lose_leadership: F2,
) where
    F1: Fn() -> Fut1 + Send + 'static,
    F2: Fn() -> Fut2 + Send + 'static,
    Fut1: Future<Output = anyhow::Result<()>> + Send + 'static,
    Fut2: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut leader_conn: Option<PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match leader_conn.as_mut() {
            None => match try_acquire(&pool, config.lock_id).await {
                Ok(Some(conn)) => {
                    info!("Gained leadership");
                    is_leader.store(true, Ordering::Relaxed);
                    leader_conn = Some(conn);

                    if let Err(e) = on_gain_leadership().await {
                        tracing::error!("Failed to execute on_gain_leadership callback: {}", e);
                    }
                }
                Ok(None) => debug!("Following - will retry"),
                Err(e) => tracing::error!("Failed to check leader lock: {}", e),
            },
            Some(conn) => {
                let ping = sqlx::query("SELECT 1").execute(&mut **conn).await;
                match ping {
                    Ok(_) => debug!("Leadership renewed (connection alive)"),
                    Err(e) => {
                        // The advisory lock died with the session
                        tracing::warn!("Lost leadership (connection died): {}", e);
                        is_leader.store(false, Ordering::Relaxed);
                        leader_conn = None;

                        if let Err(e) = on_lose_leadership().await {
                            tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
                        }
                    }
                }
            }
        }
    }

    if let Some(mut conn) = leader_conn.take() {
        if let Err(e) = on_lose_leadership().await {
            tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
        }
        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(config.lock_id)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(_) => info!("Released leadership"),
            // Closing the session drops the lock
            Err(e) => {
                tracing::warn!("Failed to release leader lock, closing connection: {}", e);
                let _ = conn.close().await;
            }
        }
        is_leader.store(false, Ordering::Relaxed);
    }
}

/// Returns the connection holding the lock, or `None` if another session holds it.
async fn try_acquire(pool: &PgPool, lock_id: i64) -> sqlx::Result<Option<PoolConnection<sqlx::Postgres>>> {
    let mut conn = pool.acquire().await?;
    let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(lock_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(acquired.then_some(conn))
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast_config(lock_id: i64) -> LeaderElectionConfig {
        LeaderElectionConfig {
            enabled: true,
            lock_id,
            interval: Duration::from_millis(20),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_only_one_replica_leads(pool: PgPool) {
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let gains = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::new();
        for flag in [first.clone(), second.clone()] {
            let gains = gains.clone();
            handles.push(tokio::spawn(leader_election_task(
                pool.clone(),
                fast_config(4242),
                flag,
                shutdown.clone(),
                move || {
                    let gains = gains.clone();
                    async move {
                        gains.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                },
                || async { Ok::<_, anyhow::Error>(()) },
            )));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gains.load(Ordering::SeqCst), 1);
        assert!(first.load(Ordering::SeqCst) ^ second.load(Ordering::SeqCst));

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!first.load(Ordering::SeqCst));
        assert!(!second.load(Ordering::SeqCst));

        // The lock was released on shutdown.
        let mut conn = pool.acquire().await.unwrap();
        let free: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(4242_i64)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert!(free);
    }
}
