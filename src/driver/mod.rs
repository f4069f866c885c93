//! Storage driver contract.
//!
//! A [`Driver`] is the disconnected half: it holds configuration and nothing
//! else. [`Driver::connect`] is the only way to obtain a [`Store`], and the
//! store is the only type with data operations, so calling one before
//! connecting does not compile. [`Store::disconnect`] consumes the store.

use std::net::IpAddr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::repo_types::{Session, TokenType, User, UserFilters, UserInsert, UserKey, UserPatch};
use crate::cache::ResourceType;
use crate::error::{ConnectionError, CreateError, DeleteError, GetError, UpdateError};
use crate::metadata::MetadataCodec;
use crate::reaper::ReaperStats;

pub mod lifecycle;
pub mod memory;
pub mod postgres;

pub use lifecycle::Lifecycle;
pub use memory::{MemoryDriver, MemoryStore};
pub use postgres::{PgDriver, PgStore};

/// A storage backend in its disconnected state.
#[async_trait]
pub trait Driver: Send + Sync {
    type Store: Store;

    async fn connect(&self) -> Result<Self::Store, ConnectionError>;
}

/// Data operations of a connected backend.
///
/// Implementations must be `Send + Sync`; callers share one store across
/// tasks and the backend serialises access to its own connections.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Closes the backend and waits for queued cleanup to finish.
    async fn disconnect(self) -> Result<(), ConnectionError>
    where
        Self: Sized;

    /// Non-deleted users matching `filters`, ordered by id.
    async fn list_users<C: MetadataCodec>(
        &self,
        limit: i64,
        offset: i64,
        filters: &UserFilters,
        codec: &C,
    ) -> Result<Vec<User<C::Value>>, GetError>;

    async fn create_user<C: MetadataCodec>(
        &self,
        insert: UserInsert<C::Value>,
        codec: &C,
    ) -> Result<User<C::Value>, CreateError>;

    /// Writes the `Set` fields of `patch` and always refreshes `updated_at`.
    async fn update_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        patch: UserPatch<C::Value>,
        codec: &C,
    ) -> Result<User<C::Value>, UpdateError>;

    /// Soft delete: stamps `deleted_at`, returns the row as deleted.
    async fn delete_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        codec: &C,
    ) -> Result<User<C::Value>, DeleteError>;

    /// `ttl_seconds = None` creates a session that never expires.
    async fn create_session(
        &self,
        user_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<Session, CreateError>;

    /// Matches on id plus exact-or-absent ip and user agent. An expired
    /// match reads as not found and is queued for deletion.
    async fn get_session(
        &self,
        session_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, GetError>;

    /// Idempotent.
    async fn delete_session(&self, session_id: Uuid) -> Result<(), DeleteError>;

    /// Returns the raw token; only its hash is stored. Replaces any live
    /// token for the same user and type.
    async fn create_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        ttl_seconds: u64,
    ) -> Result<String, CreateError>;

    /// Checks the token is live, unused and unexpired. Never mutates.
    async fn validate_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), GetError>;

    /// Same checks as validate, then marks the token used.
    async fn use_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), UpdateError>;

    /// Revokes the live token for this user and type, used or not.
    async fn delete_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
    ) -> Result<(), DeleteError>;

    /// Upsert; last write wins.
    async fn cache_set(
        &self,
        resource_type: ResourceType,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CreateError>;

    async fn cache_get(
        &self,
        resource_type: ResourceType,
        key: &str,
    ) -> Result<Option<String>, GetError>;

    /// Idempotent.
    async fn cache_delete(&self, resource_type: ResourceType, key: &str) -> Result<(), DeleteError>;

    fn cleanup_stats(&self) -> ReaperStats;
}
