//! Pluggable identity, session and cache store.
//!
//! Pick a [`driver::Driver`] (PostgreSQL or in-memory), connect it to get a
//! [`driver::Store`], and either call the store directly or wrap it in an
//! [`auth::services::AuthService`]. Schema for the PostgreSQL driver comes
//! from [`migrate::Migrator`].

pub mod auth;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod metadata;
pub mod migrate;
pub mod reaper;

pub use auth::repo_types::{
    OneTimeToken, Patch, Session, TokenType, User, UserFilters, UserInsert, UserKey, UserPatch,
};
pub use auth::services::{AuthError, AuthService};
pub use cache::ResourceType;
pub use config::StoreConfig;
pub use driver::{Driver, Lifecycle, MemoryDriver, PgDriver, Store};
pub use error::{ConnectionError, CreateError, DeleteError, DriverError, GetError, UpdateError};
pub use metadata::{JsonCodec, MetadataCodec};
