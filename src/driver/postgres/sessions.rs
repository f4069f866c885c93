use std::net::IpAddr;

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::auth::repo_types::{expiry_from_ttl, Session, SessionRow};
use crate::error::{single, CreateError, DeleteError, DriverError, GetError};
use crate::reaper::{CleanupJob, Reaper};

pub(super) async fn create(
    pool: &PgPool,
    user_id: Uuid,
    ip: Option<IpAddr>,
    user_agent: Option<&str>,
    ttl_seconds: Option<u64>,
) -> Result<Session, CreateError> {
    let expires_at = expiry_from_ttl(OffsetDateTime::now_utc(), ttl_seconds);
    // Selecting from the user table makes a missing or deleted user an
    // empty insert instead of a foreign-key error.
    let rows = sqlx::query_as::<_, SessionRow>(
        r#"
        INSERT INTO authstore.session (id, expires_at, user_id, ip, user_agent)
        SELECT $1, $2, u.id, $4, $5
        FROM authstore."user" u
        WHERE u.id = $3 AND u.deleted_at IS NULL
        RETURNING id, created_at, expires_at, user_id, ip, user_agent
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(expires_at)
    .bind(user_id)
    .bind(ip.map(|ip| ip.to_string()))
    .bind(user_agent)
    .fetch_all(pool)
    .await?;

    let row = single(rows, CreateError::CreatedTooFewRecords, CreateError::CreatedTooManyRecords)?;
    debug!(session_id = %row.id, %user_id, "session created");
    Session::try_from(row).map_err(|e| CreateError::Internal(e.to_string()))
}

pub(super) async fn get(
    pool: &PgPool,
    reaper: &Reaper,
    session_id: Uuid,
    ip: Option<IpAddr>,
    user_agent: Option<&str>,
) -> Result<Session, GetError> {
    let rows = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, created_at, expires_at, user_id, ip, user_agent
        FROM authstore.session
        WHERE id = $1
          AND ip IS NOT DISTINCT FROM $2
          AND user_agent IS NOT DISTINCT FROM $3
        "#,
    )
    .bind(session_id)
    .bind(ip.map(|ip| ip.to_string()))
    .bind(user_agent)
    .fetch_all(pool)
    .await?;

    let row = single(rows, GetError::TooFewRecords, GetError::TooManyRecords)?;
    let session = Session::try_from(row).map_err(|e| GetError::Internal(e.to_string()))?;
    if session.is_expired_at(OffsetDateTime::now_utc()) {
        debug!(%session_id, "session expired");
        reaper.schedule(CleanupJob::DeleteSession(session.id));
        return Err(GetError::TooFewRecords);
    }
    Ok(session)
}

pub(super) async fn delete(pool: &PgPool, session_id: Uuid) -> Result<(), DeleteError> {
    sqlx::query("DELETE FROM authstore.session WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Cleanup path: only removes the row if it is still expired.
pub(super) async fn delete_expired(pool: &PgPool, session_id: Uuid) -> Result<(), DriverError> {
    sqlx::query(
        "DELETE FROM authstore.session WHERE id = $1 AND expires_at IS NOT NULL AND expires_at <= now()",
    )
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}
