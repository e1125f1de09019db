use chrono::Utc;
use models::cache::CacheEntry;
use sqlx::PgPool;
use tracing::{debug, error};

pub mod route;

pub const DEFAULT_TTL_SECS: i64 = 5 * 60;

/// Database-backed key/value cache with a TTL enforced on read: `get`
/// reports a miss for expired rows, so callers never see stale values.
/// Storage failures degrade to a miss. The cache is an optimization, never a
/// correctness dependency.
#[derive(Clone, Debug)]
pub struct ApiCache {
    pool: PgPool,
    ttl: chrono::Duration,
}

impl ApiCache {
    pub fn new(pool: PgPool, ttl_secs: i64) -> Self {
        ApiCache {
            pool,
            ttl: chrono::Duration::seconds(ttl_secs),
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            "SELECT key, value, updated_at FROM api_cache WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await;

        match entry {
            Ok(Some(entry)) if Utc::now() - entry.updated_at < self.ttl => Some(entry.value),
            Ok(Some(_)) => {
                debug!(key, "cache entry expired");
                None
            }
            Ok(None) => None,
            Err(err) => {
                error!(key, "cache read failed, treating as miss: {err}");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value) {
        let result = sqlx::query(
            "INSERT INTO api_cache (key, value, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            error!(key, "cache write failed: {err}");
        }
    }

    /// Deletes every entry older than the TTL and returns the count.
    /// Invoked by an operator or an external scheduler, never self-scheduled.
    pub async fn sweep(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM api_cache WHERE updated_at < NOW() - $1::interval")
            .bind(format!("{} seconds", self.ttl.num_seconds()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
