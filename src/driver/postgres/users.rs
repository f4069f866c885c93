use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::password::hash_password;
use crate::auth::repo_types::{Patch, User, UserFilters, UserInsert, UserKey, UserPatch, UserRow};
use crate::error::{single, CreateError, DeleteError, GetError, UpdateError};
use crate::metadata::{encode_app_metadata, MetadataCodec};

const USER_COLUMNS: &str = "id, created_at, updated_at, deleted_at, role, email, password_hash, \
     email_confirmed_at, phone_number, phone_number_confirmed_at, last_sign_in, \
     app_metadata::text AS app_metadata, user_metadata::text AS user_metadata, banned_until";

fn push_key(builder: &mut QueryBuilder<'_, Postgres>, key: &UserKey) {
    builder.push(key.column());
    builder.push(" = ");
    match key {
        UserKey::Id(id) => builder.push_bind(*id),
        UserKey::Email(v) | UserKey::PhoneNumber(v) => builder.push_bind(v.clone()),
    };
}

fn push_set<'a, T>(builder: &mut QueryBuilder<'a, Postgres>, column: &str, patch: Patch<T>)
where
    T: 'a + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres> + Send,
{
    if let Patch::Set(value) = patch {
        builder.push(", ");
        builder.push(column);
        builder.push(" = ");
        builder.push_bind(value);
    }
}

pub(super) async fn list<C: MetadataCodec>(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    filters: &UserFilters,
    codec: &C,
) -> Result<Vec<User<C::Value>>, GetError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        r#"SELECT {USER_COLUMNS} FROM authstore."user" WHERE deleted_at IS NULL"#
    ));

    let clauses = [
        ("id::text", &filters.id),
        ("email", &filters.email),
        ("phone_number", &filters.phone_number),
    ];
    let mut first = true;
    for (column, patterns) in clauses {
        let Some(patterns) = patterns else { continue };
        builder.push(if first { " AND (" } else { " OR " });
        first = false;
        builder.push(column);
        builder.push(" LIKE ANY(");
        builder.push_bind(patterns.clone());
        builder.push(")");
    }
    if !first {
        builder.push(")");
    }

    builder.push(" ORDER BY id LIMIT ");
    builder.push_bind(limit);
    builder.push(" OFFSET ");
    builder.push_bind(offset);

    let rows = builder.build_query_as::<UserRow>().fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| row.decode(codec).map_err(|e| GetError::Internal(e.to_string())))
        .collect()
}

pub(super) async fn create<C: MetadataCodec>(
    pool: &PgPool,
    insert: UserInsert<C::Value>,
    codec: &C,
) -> Result<User<C::Value>, CreateError> {
    let password_hash = insert
        .password
        .as_deref()
        .map(hash_password)
        .transpose()
        .map_err(|e| CreateError::Hash(e.to_string()))?;
    let user_metadata = codec
        .encode(&insert.user_metadata)
        .map_err(|e| CreateError::Internal(e.to_string()))?;
    let app_metadata = encode_app_metadata(&insert.app_metadata)
        .map_err(|e| CreateError::Internal(e.to_string()))?;

    let rows = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        INSERT INTO authstore."user"
            (id, role, email, password_hash, email_confirmed_at, phone_number,
             phone_number_confirmed_at, app_metadata, user_metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8::jsonb, $9::jsonb)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(Uuid::now_v7())
    .bind(insert.role)
    .bind(insert.email)
    .bind(password_hash)
    .bind(insert.email_confirmed_at)
    .bind(insert.phone_number)
    .bind(insert.phone_number_confirmed_at)
    .bind(app_metadata)
    .bind(user_metadata)
    .fetch_all(pool)
    .await?;

    let row = single(rows, CreateError::CreatedTooFewRecords, CreateError::CreatedTooManyRecords)?;
    debug!(user_id = %row.id, "user created");
    row.decode(codec)
        .map_err(|e| CreateError::Internal(e.to_string()))
}

pub(super) async fn update<C: MetadataCodec>(
    pool: &PgPool,
    key: &UserKey,
    patch: UserPatch<C::Value>,
    codec: &C,
) -> Result<User<C::Value>, UpdateError> {
    let password_hash = match patch.password {
        Patch::Set(Some(plain)) => Patch::Set(Some(
            hash_password(&plain).map_err(|e| UpdateError::Hash(e.to_string()))?,
        )),
        Patch::Set(None) => Patch::Set(None),
        Patch::Ignore => Patch::Ignore,
    };
    let user_metadata = match patch.user_metadata {
        Patch::Set(v) => Some(codec.encode(&v).map_err(|e| UpdateError::Internal(e.to_string()))?),
        Patch::Ignore => None,
    };
    let app_metadata = match patch.app_metadata {
        Patch::Set(v) => {
            Some(encode_app_metadata(&v).map_err(|e| UpdateError::Internal(e.to_string()))?)
        }
        Patch::Ignore => None,
    };

    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new(r#"UPDATE authstore."user" SET updated_at = now()"#);
    push_set(&mut builder, "role", patch.role);
    push_set(&mut builder, "email", patch.email);
    push_set(&mut builder, "password_hash", password_hash);
    push_set(&mut builder, "email_confirmed_at", patch.email_confirmed_at);
    push_set(&mut builder, "phone_number", patch.phone_number);
    push_set(
        &mut builder,
        "phone_number_confirmed_at",
        patch.phone_number_confirmed_at,
    );
    push_set(&mut builder, "last_sign_in", patch.last_sign_in);
    push_set(&mut builder, "banned_until", patch.banned_until);
    if let Some(text) = app_metadata {
        builder.push(", app_metadata = ");
        builder.push_bind(text);
        builder.push("::jsonb");
    }
    if let Some(text) = user_metadata {
        builder.push(", user_metadata = ");
        builder.push_bind(text);
        builder.push("::jsonb");
    }
    builder.push(" WHERE deleted_at IS NULL AND ");
    push_key(&mut builder, key);
    builder.push(format!(" RETURNING {USER_COLUMNS}"));

    let mut tx = pool.begin().await?;
    let rows = builder
        .build_query_as::<UserRow>()
        .fetch_all(&mut *tx)
        .await?;
    let row = match single(rows, UpdateError::UpdatedTooFewRecords, UpdateError::UpdatedTooManyRecords) {
        Ok(row) => row,
        Err(e) => {
            warn!(column = key.column(), error = %e, "user update rolled back");
            tx.rollback().await?;
            return Err(e);
        }
    };
    tx.commit().await?;

    debug!(user_id = %row.id, "user updated");
    row.decode(codec)
        .map_err(|e| UpdateError::Internal(e.to_string()))
}

pub(super) async fn delete<C: MetadataCodec>(
    pool: &PgPool,
    key: &UserKey,
    codec: &C,
) -> Result<User<C::Value>, DeleteError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"UPDATE authstore."user" SET deleted_at = now(), updated_at = now() WHERE deleted_at IS NULL AND "#,
    );
    push_key(&mut builder, key);
    builder.push(format!(" RETURNING {USER_COLUMNS}"));

    let mut tx = pool.begin().await?;
    let rows = builder
        .build_query_as::<UserRow>()
        .fetch_all(&mut *tx)
        .await?;
    let row = match single(rows, DeleteError::DeletedTooFewRecords, DeleteError::DeletedTooManyRecords) {
        Ok(row) => row,
        Err(e) => {
            warn!(column = key.column(), error = %e, "user delete rolled back");
            tx.rollback().await?;
            return Err(e);
        }
    };
    tx.commit().await?;

    debug!(user_id = %row.id, "user soft-deleted");
    row.decode(codec)
        .map_err(|e| DeleteError::Internal(e.to_string()))
}
