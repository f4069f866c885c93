use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::debug;

use crate::auth::repo_types::expiry_from_ttl;
use crate::cache::{CacheEntry, ResourceType};
use crate::error::{CreateError, DeleteError, DriverError, GetError};
use crate::reaper::{CleanupJob, Reaper};

pub(super) async fn set(
    pool: &PgPool,
    resource_type: ResourceType,
    key: &str,
    value: &str,
    ttl_seconds: Option<u64>,
) -> Result<(), CreateError> {
    sqlx::query(
        r#"
        INSERT INTO authstore.cache (resource_type, key, value, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (resource_type, key)
        DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(resource_type.as_str())
    .bind(key)
    .bind(value)
    .bind(expiry_from_ttl(OffsetDateTime::now_utc(), ttl_seconds))
    .execute(pool)
    .await?;
    Ok(())
}

pub(super) async fn get(
    pool: &PgPool,
    reaper: &Reaper,
    resource_type: ResourceType,
    key: &str,
) -> Result<Option<String>, GetError> {
    let entry = sqlx::query_as::<_, CacheEntry>(
        r#"
        SELECT resource_type, key, value, expires_at
        FROM authstore.cache
        WHERE resource_type = $1 AND key = $2
        "#,
    )
    .bind(resource_type.as_str())
    .bind(key)
    .fetch_optional(pool)
    .await?;

    match entry {
        Some(e) if e.is_expired_at(OffsetDateTime::now_utc()) => {
            debug!(%resource_type, key, "cache entry expired");
            reaper.schedule(CleanupJob::DeleteCacheEntry {
                resource_type,
                key: key.to_string(),
            });
            Ok(None)
        }
        Some(e) => Ok(Some(e.value)),
        None => Ok(None),
    }
}

pub(super) async fn delete(
    pool: &PgPool,
    resource_type: ResourceType,
    key: &str,
) -> Result<(), DeleteError> {
    sqlx::query("DELETE FROM authstore.cache WHERE resource_type = $1 AND key = $2")
        .bind(resource_type.as_str())
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Cleanup path: a key set again after the read is left alone.
pub(super) async fn delete_expired(
    pool: &PgPool,
    resource_type: ResourceType,
    key: &str,
) -> Result<(), DriverError> {
    sqlx::query(
        r#"
        DELETE FROM authstore.cache
        WHERE resource_type = $1 AND key = $2
          AND expires_at IS NOT NULL AND expires_at <= now()
        "#,
    )
    .bind(resource_type.as_str())
    .bind(key)
    .execute(pool)
    .await?;
    Ok(())
}
