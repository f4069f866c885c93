//! PostgreSQL driver.
//!
//! All tables live in the `authstore` schema created by the `base` migration
//! module; run [`crate::migrate::Migrator`] before connecting a store.
//!
//! ```ignore
//! use authstore::{config::StoreConfig, driver::{Driver, PgDriver}};
//!
//! let driver = PgDriver::new(StoreConfig::new("postgres://localhost/app").max_connections(20));
//! let store = driver.connect().await?;
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Driver, Store};
use crate::auth::repo_types::{Session, TokenType, User, UserFilters, UserInsert, UserKey, UserPatch};
use crate::cache::ResourceType;
use crate::config::StoreConfig;
use crate::error::{ConnectionError, CreateError, DeleteError, DriverError, GetError, UpdateError};
use crate::metadata::MetadataCodec;
use crate::reaper::{CleanupFn, CleanupFuture, CleanupJob, Reaper, ReaperStats};

mod cache;
mod sessions;
mod tokens;
mod users;


/// Disconnected PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct PgDriver {
    config: StoreConfig,
}

impl PgDriver {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[async_trait]
impl Driver for PgDriver {
    type Store = PgStore;

    async fn connect(&self) -> Result<PgStore, ConnectionError> {
        let c = &self.config;
        let pool = PgPoolOptions::new()
            .max_connections(c.max_connections)
            .min_connections(c.min_connections)
            .acquire_timeout(c.acquire_timeout)
            .idle_timeout(c.idle_timeout)
            .connect(&c.database_url)
            .await?;
        info!(max_connections = c.max_connections, "postgres pool ready");
        Ok(PgStore::from_pool(pool, c.cleanup_queue_capacity))
    }
}

/// Connected PostgreSQL backend.
pub struct PgStore {
    pool: PgPool,
    reaper: Reaper,
}

impl PgStore {
    /// Wraps an existing pool. Must be called inside a tokio runtime.
    pub fn from_pool(pool: PgPool, cleanup_queue_capacity: usize) -> Self {
        let cleanup_pool = pool.clone();
        let cleanup_fn: CleanupFn = Arc::new(move |job: CleanupJob| -> CleanupFuture {
            let pool = cleanup_pool.clone();
            Box::pin(async move { run_cleanup(&pool, job).await })
        });
        Self {
            pool,
            reaper: Reaper::spawn(cleanup_queue_capacity, cleanup_fn),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn run_cleanup(pool: &PgPool, job: CleanupJob) -> Result<(), DriverError> {
    match job {
        CleanupJob::DeleteSession(id) => sessions::delete_expired(pool, id).await,
        CleanupJob::RevokeToken(id) => tokens::revoke(pool, id).await,
        CleanupJob::DeleteCacheEntry { resource_type, key } => {
            cache::delete_expired(pool, resource_type, &key).await
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn disconnect(self) -> Result<(), ConnectionError> {
        let stats = self.reaper.shutdown().await;
        debug!(?stats, "cleanup queue drained");
        self.pool.close().await;
        info!("postgres pool closed");
        Ok(())
    }

    async fn list_users<C: MetadataCodec>(
        &self,
        limit: i64,
        offset: i64,
        filters: &UserFilters,
        codec: &C,
    ) -> Result<Vec<User<C::Value>>, GetError> {
        users::list(&self.pool, limit, offset, filters, codec).await
    }

    async fn create_user<C: MetadataCodec>(
        &self,
        insert: UserInsert<C::Value>,
        codec: &C,
    ) -> Result<User<C::Value>, CreateError> {
        users::create(&self.pool, insert, codec).await
    }

    async fn update_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        patch: UserPatch<C::Value>,
        codec: &C,
    ) -> Result<User<C::Value>, UpdateError> {
        users::update(&self.pool, key, patch, codec).await
    }

    async fn delete_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        codec: &C,
    ) -> Result<User<C::Value>, DeleteError> {
        users::delete(&self.pool, key, codec).await
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<Session, CreateError> {
        sessions::create(&self.pool, user_id, ip, user_agent, ttl_seconds).await
    }

    async fn get_session(
        &self,
        session_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, GetError> {
        sessions::get(&self.pool, &self.reaper, session_id, ip, user_agent).await
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), DeleteError> {
        sessions::delete(&self.pool, session_id).await
    }

    async fn create_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        ttl_seconds: u64,
    ) -> Result<String, CreateError> {
        tokens::create(&self.pool, user_id, token_type, ttl_seconds).await
    }

    async fn validate_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), GetError> {
        tokens::validate(&self.pool, user_id, token_type, token).await
    }

    async fn use_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), UpdateError> {
        tokens::consume(&self.pool, &self.reaper, user_id, token_type, token).await
    }

    async fn delete_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
    ) -> Result<(), DeleteError> {
        tokens::delete(&self.pool, user_id, token_type).await
    }

    async fn cache_set(
        &self,
        resource_type: ResourceType,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CreateError> {
        cache::set(&self.pool, resource_type, key, value, ttl_seconds).await
    }

    async fn cache_get(
        &self,
        resource_type: ResourceType,
        key: &str,
    ) -> Result<Option<String>, GetError> {
        cache::get(&self.pool, &self.reaper, resource_type, key).await
    }

    async fn cache_delete(&self, resource_type: ResourceType, key: &str) -> Result<(), DeleteError> {
        cache::delete(&self.pool, resource_type, key).await
    }

    fn cleanup_stats(&self) -> ReaperStats {
        self.reaper.stats()
    }
}
