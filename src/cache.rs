//! Namespaced key/value cache types.
//!
//! The relational cache table is UNLOGGED: a database crash or restart may
//! lose every entry. Nothing durable belongs here.

use std::fmt;

use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// Cache namespace. Use the associated constants or declare new ones with
/// [`ResourceType::new`] so names are spelled in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceType(&'static str);

impl ResourceType {
    pub const SESSION: Self = Self::new("session");
    pub const RATE_LIMIT: Self = Self::new("rate_limit");
    pub const EMAIL_CHALLENGE: Self = Self::new("email_challenge");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CacheEntry {
    pub resource_type: String,
    pub key: String,
    pub value: String,
    pub expires_at: Option<OffsetDateTime>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}
