use chrono::{DateTime, Utc};
use models::gps::{GpsFix, ModemGps};
use sqlx::PgPool;
use std::future::Future;
use tracing::warn;

pub mod batch;
pub mod client;
pub mod limiter;
pub mod provider;
pub mod route;

/// Stored fixes younger than this are served without an upstream call.
pub const FRESH_WINDOW_SECS: i64 = 15 * 60;

const DB_RETRY_ATTEMPTS: u32 = 3;

pub fn is_fresh(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - timestamp < chrono::Duration::seconds(FRESH_WINDOW_SECS)
}

/// Most recent fix of a batch, by fix timestamp.
pub fn most_recent(fixes: &[GpsFix]) -> Option<&GpsFix> {
    fixes.iter().max_by_key(|fix| fix.timestamp)
}

/// Upserts the latest known position for a modem. The update is conditional
/// on the incoming timestamp: an out-of-order or delayed response never
/// overwrites a newer stored fix.
pub async fn upsert_position(
    pool: &PgPool,
    modem_id: &str,
    provider: &str,
    fix: &GpsFix,
) -> sqlx::Result<()> {
    with_db_retry(|| async {
        sqlx::query(
            "INSERT INTO modem_gps (modem_id, provider, latitude, longitude, timestamp, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (modem_id, provider) DO UPDATE
             SET latitude = EXCLUDED.latitude,
                 longitude = EXCLUDED.longitude,
                 timestamp = EXCLUDED.timestamp,
                 updated_at = NOW()
             WHERE modem_gps.timestamp <= EXCLUDED.timestamp",
        )
        .bind(modem_id)
        .bind(provider)
        .bind(fix.lat)
        .bind(fix.lon)
        .bind(fix.timestamp)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn latest_position(
    pool: &PgPool,
    modem_id: &str,
    provider: &str,
) -> sqlx::Result<Option<ModemGps>> {
    with_db_retry(|| async {
        sqlx::query_as::<_, ModemGps>(
            "SELECT modem_id, provider, latitude, longitude, timestamp, updated_at
             FROM modem_gps
             WHERE modem_id = $1 AND provider = $2",
        )
        .bind(modem_id)
        .bind(provider)
        .fetch_optional(pool)
        .await
    })
    .await
}

/// Latest stored position per modem across providers, for the read-only
/// query endpoint. Unknown ids are simply absent from the result.
pub async fn latest_positions(pool: &PgPool, modem_ids: &[String]) -> sqlx::Result<Vec<ModemGps>> {
    with_db_retry(|| async {
        sqlx::query_as::<_, ModemGps>(
            "SELECT DISTINCT ON (modem_id)
                 modem_id, provider, latitude, longitude, timestamp, updated_at
             FROM modem_gps
             WHERE modem_id = ANY($1)
             ORDER BY modem_id, timestamp DESC",
        )
        .bind(modem_ids)
        .fetch_all(pool)
        .await
    })
    .await
}

/// Runs a database operation up to three times, retrying only on
/// connection-level errors where a fresh pool checkout can succeed.
pub async fn with_db_retry<T, F, Fut>(mut op: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < DB_RETRY_ATTEMPTS && is_transient(&err) => {
                warn!(attempt, "transient database error, retrying: {err}");
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fix_at(secs: i64) -> GpsFix {
        GpsFix {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            lat: 55.0,
            lon: 12.0,
        }
    }

    #[test]
    fn most_recent_picks_the_newest_timestamp() {
        let fixes = vec![fix_at(100), fix_at(300), fix_at(200)];
        assert_eq!(most_recent(&fixes), Some(&fixes[1]));
        assert_eq!(most_recent(&[]), None);
    }

    #[test]
    fn freshness_window_is_fifteen_minutes() {
        let now = Utc.timestamp_opt(10_000, 0).unwrap();
        assert!(is_fresh(now - chrono::Duration::seconds(14 * 60), now));
        assert!(!is_fresh(now - chrono::Duration::seconds(16 * 60), now));
    }

    #[tokio::test]
    async fn db_retry_gives_up_on_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: sqlx::Result<()> = with_db_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn db_retry_recovers_from_a_transient_error() {
        let calls = AtomicU32::new(0);
        let result = with_db_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(sqlx::Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stale connection",
                )))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for db tests");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("failed to connect to test database");
        sqlx::migrate!().run(&pool).await.expect("migration failed");
        pool
    }

    // Needs a running Postgres and DATABASE_URL; run with --ignored.
    #[tokio::test]
    #[ignore]
    async fn upsert_keeps_one_row_per_modem_and_provider() {
        let pool = test_pool().await;
        let modem_id = format!("modem-{}", Utc::now().timestamp_nanos_opt().unwrap());

        upsert_position(&pool, &modem_id, "starlink", &fix_at(1_000)).await.unwrap();
        upsert_position(&pool, &modem_id, "starlink", &fix_at(2_000)).await.unwrap();

        let stored = latest_position(&pool, &modem_id, "starlink")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.timestamp, fix_at(2_000).timestamp);

        let rows = latest_positions(&pool, &[modem_id.clone()]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn upsert_never_overwrites_a_newer_fix_with_an_older_one() {
        let pool = test_pool().await;
        let modem_id = format!("modem-{}", Utc::now().timestamp_nanos_opt().unwrap());

        upsert_position(&pool, &modem_id, "oneweb", &fix_at(5_000)).await.unwrap();
        // delayed response carrying an older fix
        upsert_position(&pool, &modem_id, "oneweb", &fix_at(4_000)).await.unwrap();

        let stored = latest_position(&pool, &modem_id, "oneweb")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.timestamp, fix_at(5_000).timestamp);
    }

    #[tokio::test]
    #[ignore]
    async fn unknown_modems_are_absent_from_query_results() {
        let pool = test_pool().await;
        let rows = latest_positions(&pool, &["never-stored".to_string()])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn db_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: sqlx::Result<()> = with_db_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::PoolTimedOut)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), DB_RETRY_ATTEMPTS);
    }
}
