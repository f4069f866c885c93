use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::repo_types::{expires_in, OneTimeToken, TokenType};
use crate::auth::token::{generate_token, hash_token};
use crate::error::{single, CreateError, DeleteError, DriverError, GetError, UpdateError};
use crate::reaper::{CleanupJob, Reaper};

const TOKEN_COLUMNS: &str =
    "id, created_at, deleted_at, expires_at, used_at, token_type, user_id, token_hash";

pub(super) async fn create(
    pool: &PgPool,
    user_id: Uuid,
    token_type: TokenType,
    ttl_seconds: u64,
) -> Result<String, CreateError> {
    let token = generate_token();
    let expires_at = expires_in(OffsetDateTime::now_utc(), ttl_seconds);

    let mut tx = pool.begin().await?;
    let replaced = sqlx::query(
        r#"
        UPDATE authstore.one_time_token
        SET deleted_at = now()
        WHERE user_id = $1 AND token_type = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(user_id)
    .bind(token_type.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO authstore.one_time_token (id, expires_at, token_type, user_id, token_hash)
        SELECT $1, $2, $3, u.id, $5
        FROM authstore."user" u
        WHERE u.id = $4 AND u.deleted_at IS NULL
        RETURNING id
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(expires_at)
    .bind(token_type.as_str())
    .bind(user_id)
    .bind(hash_token(&token))
    .fetch_all(&mut *tx)
    .await?;

    if let Err(e) = single(ids, CreateError::CreatedTooFewRecords, CreateError::CreatedTooManyRecords) {
        tx.rollback().await?;
        return Err(e);
    }
    tx.commit().await?;

    debug!(%user_id, token_type = token_type.as_str(), replaced, "one-time token issued");
    Ok(token)
}

async fn find_live(
    pool: &PgPool,
    user_id: Uuid,
    token_type: TokenType,
    token_hash: &str,
) -> Result<Vec<OneTimeToken>, sqlx::Error> {
    sqlx::query_as::<_, OneTimeToken>(&format!(
        r#"
        SELECT {TOKEN_COLUMNS}
        FROM authstore.one_time_token
        WHERE user_id = $1 AND token_type = $2 AND token_hash = $3 AND deleted_at IS NULL
        "#
    ))
    .bind(user_id)
    .bind(token_type.as_str())
    .bind(token_hash)
    .fetch_all(pool)
    .await
}

pub(super) async fn validate(
    pool: &PgPool,
    user_id: Uuid,
    token_type: TokenType,
    token: &str,
) -> Result<(), GetError> {
    let rows = find_live(pool, user_id, token_type, &hash_token(token)).await?;
    let found = single(rows, GetError::TooFewRecords, GetError::TooManyRecords)?;
    if !found.is_usable_at(OffsetDateTime::now_utc()) {
        return Err(GetError::TooFewRecords);
    }
    Ok(())
}

/// Marks the token used. The conditional update is the check, so two
/// concurrent callers cannot both succeed.
pub(super) async fn consume(
    pool: &PgPool,
    reaper: &Reaper,
    user_id: Uuid,
    token_type: TokenType,
    token: &str,
) -> Result<(), UpdateError> {
    let token_hash = hash_token(token);
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        r#"
        UPDATE authstore.one_time_token
        SET used_at = now()
        WHERE user_id = $1 AND token_type = $2 AND token_hash = $3
          AND deleted_at IS NULL AND used_at IS NULL AND expires_at > now()
        "#,
    )
    .bind(user_id)
    .bind(token_type.as_str())
    .bind(&token_hash)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    match rows {
        1 => {
            tx.commit().await?;
            debug!(%user_id, token_type = token_type.as_str(), "one-time token used");
            Ok(())
        }
        0 => {
            tx.rollback().await?;
            // Expired but never revoked: queue the revoke.
            let now = OffsetDateTime::now_utc();
            for t in find_live(pool, user_id, token_type, &token_hash).await? {
                if t.used_at.is_none() && now >= t.expires_at {
                    reaper.schedule(CleanupJob::RevokeToken(t.id));
                }
            }
            Err(UpdateError::UpdatedTooFewRecords)
        }
        n => {
            warn!(%user_id, rows = n, "one-time token use matched several rows");
            tx.rollback().await?;
            Err(UpdateError::UpdatedTooManyRecords)
        }
    }
}

pub(super) async fn delete(
    pool: &PgPool,
    user_id: Uuid,
    token_type: TokenType,
) -> Result<(), DeleteError> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        r#"
        UPDATE authstore.one_time_token
        SET deleted_at = now()
        WHERE user_id = $1 AND token_type = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(user_id)
    .bind(token_type.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    match rows {
        1 => {
            tx.commit().await?;
            Ok(())
        }
        0 => {
            tx.rollback().await?;
            Err(DeleteError::DeletedTooFewRecords)
        }
        _ => {
            tx.rollback().await?;
            Err(DeleteError::DeletedTooManyRecords)
        }
    }
}

/// Cleanup path: soft-deletes a token if nobody revoked it already.
pub(super) async fn revoke(pool: &PgPool, token_id: Uuid) -> Result<(), DriverError> {
    sqlx::query(
        "UPDATE authstore.one_time_token SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(token_id)
    .execute(pool)
    .await?;
    Ok(())
}
