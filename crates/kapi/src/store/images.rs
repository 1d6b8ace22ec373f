//! Image-probe caches.
//!
//! Decoded container configs are cached with a TTL so pod validation does
//! not hammer registries, and failed private-registry logins are remembered
//! so we do not get the account blocked by hammering the login endpoint.

use chrono::{Duration, NaiveDateTime, Utc};

use crate::store::DbPool;
use crate::Result;

/// How long a cached image config stays fresh.
pub fn cache_ttl() -> Duration {
    Duration::hours(4)
}

/// A cached container config, keyed by the full image reference.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ImageCacheRow {
    /// Full image reference, e.g. `quay.io/coreos/etcd:v3.3`.
    pub image: String,
    /// The decoded container config.
    pub data: serde_json::Value,
    /// When the entry was written.
    pub time_stamp: NaiveDateTime,
}

impl ImageCacheRow {
    /// Whether the entry is past its TTL.
    pub fn outdated(&self, now: NaiveDateTime) -> bool {
        now - self.time_stamp > cache_ttl()
    }

    /// Look up a cache entry.
    pub async fn get(pool: &DbPool, image: &str) -> Result<Option<ImageCacheRow>> {
        Ok(sqlx::query_as("SELECT * FROM image_cache WHERE image = $1")
            .bind(image)
            .fetch_optional(pool)
            .await?)
    }

    /// Insert or refresh a cache entry.
    pub async fn put(pool: &DbPool, image: &str, data: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO image_cache (image, data, time_stamp) VALUES ($1, $2, $3) \
             ON CONFLICT (image) DO UPDATE SET data = EXCLUDED.data, time_stamp = EXCLUDED.time_stamp",
        )
        .bind(image)
        .bind(data)
        .bind(Utc::now().naive_utc())
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Remember one failed login to a private registry.
pub async fn save_failed_login(pool: &DbPool, login: &str, registry: &str) -> Result<()> {
    if login.is_empty() || registry.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO private_registry_failed_login (login, registry, created) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
    )
    .bind(login)
    .bind(registry)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;
    Ok(())
}

/// When the last failed login for (login, registry) happened, if ever.
pub async fn last_failed_login(
    pool: &DbPool,
    login: &str,
    registry: &str,
) -> Result<Option<NaiveDateTime>> {
    let row: Option<(NaiveDateTime,)> = sqlx::query_as(
        "SELECT created FROM private_registry_failed_login \
         WHERE login = $1 AND registry = $2 ORDER BY created DESC LIMIT 1",
    )
    .bind(login)
    .bind(registry)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(created,)| created))
}
