//! In-memory driver.
//!
//! Implements the same contract as the relational driver over mutex-guarded
//! tables. Data lives as long as the [`MemoryDriver`], so a disconnect and
//! reconnect keeps it; nothing survives the process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{Driver, Store};
use crate::auth::password::hash_password;
use crate::auth::repo_types::{
    expires_in, expiry_from_ttl, OneTimeToken, Patch, Session, TokenType, User, UserFilters,
    UserInsert, UserKey, UserPatch, UserRow,
};
use crate::auth::token::{generate_token, hash_token};
use crate::cache::{CacheEntry, ResourceType};
use crate::config::DEFAULT_CLEANUP_QUEUE_CAPACITY;
use crate::error::{
    single, ConnectionError, CreateError, DeleteError, DriverError, GetError, UpdateError,
};
use crate::metadata::{encode_app_metadata, MetadataCodec};
use crate::reaper::{CleanupFn, CleanupFuture, CleanupJob, Reaper, ReaperStats};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<UserRow>,
    sessions: HashMap<Uuid, Session>,
    tokens: Vec<OneTimeToken>,
    cache: HashMap<(String, String), CacheEntry>,
}

impl Tables {
    fn live_user_mut(&mut self, key: &UserKey) -> Vec<&mut UserRow> {
        self.users
            .iter_mut()
            .filter(|u| u.deleted_at.is_none() && user_matches_key(u, key))
            .collect()
    }

    fn live_user_exists(&self, id: Uuid) -> bool {
        self.users
            .iter()
            .any(|u| u.id == id && u.deleted_at.is_none())
    }

    /// Unique-among-live check for email and phone number, ignoring `except`.
    fn check_contact_unique(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        except: Option<Uuid>,
    ) -> Result<(), DriverError> {
        for u in self
            .users
            .iter()
            .filter(|u| u.deleted_at.is_none() && Some(u.id) != except)
        {
            if email.is_some() && u.email.as_deref() == email {
                return Err(DriverError::UniqueViolation("email"));
            }
            if phone_number.is_some() && u.phone_number.as_deref() == phone_number {
                return Err(DriverError::UniqueViolation("phone_number"));
            }
        }
        Ok(())
    }

    fn run(&mut self, job: &CleanupJob, now: OffsetDateTime) {
        match job {
            CleanupJob::DeleteSession(id) => {
                if self.sessions.get(id).is_some_and(|s| s.is_expired_at(now)) {
                    self.sessions.remove(id);
                }
            }
            CleanupJob::RevokeToken(id) => {
                if let Some(t) = self
                    .tokens
                    .iter_mut()
                    .find(|t| t.id == *id && t.deleted_at.is_none())
                {
                    t.deleted_at = Some(now);
                }
            }
            CleanupJob::DeleteCacheEntry { resource_type, key } => {
                let k = (resource_type.as_str().to_string(), key.clone());
                // The key may have been set again since the read.
                if self.cache.get(&k).is_some_and(|e| e.is_expired_at(now)) {
                    self.cache.remove(&k);
                }
            }
        }
    }
}

fn user_matches_key(user: &UserRow, key: &UserKey) -> bool {
    match key {
        UserKey::Id(id) => user.id == *id,
        UserKey::Email(email) => user.email.as_deref() == Some(email.as_str()),
        UserKey::PhoneNumber(phone) => user.phone_number.as_deref() == Some(phone.as_str()),
    }
}

fn user_matches_filters(user: &UserRow, filters: &UserFilters) -> bool {
    if filters.is_empty() {
        return true;
    }
    let id = user.id.to_string();
    let any = |patterns: &Option<Vec<String>>, value: Option<&str>| {
        patterns.as_ref().is_some_and(|ps| {
            value.is_some_and(|v| ps.iter().any(|p| like_match(p, v)))
        })
    };
    any(&filters.id, Some(id.as_str()))
        || any(&filters.email, user.email.as_deref())
        || any(&filters.phone_number, user.phone_number.as_deref())
}

/// SQL `LIKE` with `%`, `_` and backslash escapes.
pub(crate) fn like_match(pattern: &str, text: &str) -> bool {
    #[derive(Clone, Copy)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        toks.push(match c {
            '%' => Tok::Any,
            '_' => Tok::One,
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            c => Tok::Lit(c),
        });
    }
    let text: Vec<char> = text.chars().collect();

    // reachable[j]: pattern prefix consumed so far matches text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for tok in toks {
        let mut next = vec![false; text.len() + 1];
        match tok {
            Tok::Any => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            Tok::One => {
                for j in 0..text.len() {
                    next[j + 1] = reachable[j];
                }
            }
            Tok::Lit(c) => {
                for j in 0..text.len() {
                    next[j + 1] = reachable[j] && text[j] == c;
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

/// Driver for the in-memory backend.
#[derive(Clone)]
pub struct MemoryDriver {
    tables: Arc<Mutex<Tables>>,
    cleanup_queue_capacity: usize,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            cleanup_queue_capacity: DEFAULT_CLEANUP_QUEUE_CAPACITY,
        }
    }

    pub fn cleanup_queue_capacity(mut self, capacity: usize) -> Self {
        self.cleanup_queue_capacity = capacity;
        self
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    type Store = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore, ConnectionError> {
        let tables = self.tables.clone();
        let cleanup_fn: CleanupFn = Arc::new(move |job: CleanupJob| -> CleanupFuture {
            let tables = tables.clone();
            Box::pin(async move {
                tables.lock().run(&job, OffsetDateTime::now_utc());
                Ok::<(), DriverError>(())
            })
        });
        Ok(MemoryStore {
            tables: self.tables.clone(),
            reaper: Reaper::spawn(self.cleanup_queue_capacity, cleanup_fn),
        })
    }
}

/// Connected in-memory store.
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    reaper: Reaper,
}

impl MemoryStore {
    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.tables.lock().cache.len()
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> Vec<OneTimeToken> {
        self.tables.lock().tokens.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn disconnect(self) -> Result<(), ConnectionError> {
        let stats = self.reaper.shutdown().await;
        debug!(?stats, "memory store closed");
        Ok(())
    }

    async fn list_users<C: MetadataCodec>(
        &self,
        limit: i64,
        offset: i64,
        filters: &UserFilters,
        codec: &C,
    ) -> Result<Vec<User<C::Value>>, GetError> {
        let mut rows: Vec<UserRow> = self
            .tables
            .lock()
            .users
            .iter()
            .filter(|u| u.deleted_at.is_none() && user_matches_filters(u, filters))
            .cloned()
            .collect();
        rows.sort_by_key(|u| u.id);
        rows.into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|row| row.decode(codec).map_err(|e| GetError::Internal(e.to_string())))
            .collect()
    }

    async fn create_user<C: MetadataCodec>(
        &self,
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

        let now = OffsetDateTime::now_utc();
        let row = UserRow {
            id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            role: insert.role,
            email: insert.email,
            password_hash,
            email_confirmed_at: insert.email_confirmed_at,
            phone_number: insert.phone_number,
            phone_number_confirmed_at: insert.phone_number_confirmed_at,
            last_sign_in: None,
            app_metadata,
            user_metadata,
            banned_until: None,
        };
        {
            let mut tables = self.tables.lock();
            tables.check_contact_unique(row.email.as_deref(), row.phone_number.as_deref(), None)?;
            tables.users.push(row.clone());
        }
        row.decode(codec)
            .map_err(|e| CreateError::Internal(e.to_string()))
    }

    async fn update_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        patch: UserPatch<C::Value>,
        codec: &C,
    ) -> Result<User<C::Value>, UpdateError> {
        // Encode and hash before taking the lock.
        let password_hash = match patch.password {
            Patch::Set(Some(ref plain)) => Patch::Set(Some(
                hash_password(plain).map_err(|e| UpdateError::Hash(e.to_string()))?,
            )),
            Patch::Set(None) => Patch::Set(None),
            Patch::Ignore => Patch::Ignore,
        };
        let user_metadata = match patch.user_metadata.as_set() {
            Some(v) => Patch::Set(codec.encode(v).map_err(|e| UpdateError::Internal(e.to_string()))?),
            None => Patch::Ignore,
        };
        let app_metadata = match patch.app_metadata.as_set() {
            Some(v) => Patch::Set(
                encode_app_metadata(v).map_err(|e| UpdateError::Internal(e.to_string()))?,
            ),
            None => Patch::Ignore,
        };

        let row = {
            let mut tables = self.tables.lock();
            let target = {
                let matches = tables.live_user_mut(key);
                match matches.len() {
                    0 => return Err(UpdateError::UpdatedTooFewRecords),
                    1 => matches[0].id,
                    _ => return Err(UpdateError::UpdatedTooManyRecords),
                }
            };
            let email = patch.email.as_set().map(|e| e.as_deref());
            let phone = patch.phone_number.as_set().map(|p| p.as_deref());
            tables.check_contact_unique(email.flatten(), phone.flatten(), Some(target))?;

            let user = tables
                .users
                .iter_mut()
                .find(|u| u.id == target)
                .ok_or(UpdateError::UpdatedTooFewRecords)?;
            patch.role.apply_to(&mut user.role);
            patch.email.apply_to(&mut user.email);
            password_hash.apply_to(&mut user.password_hash);
            patch.email_confirmed_at.apply_to(&mut user.email_confirmed_at);
            patch.phone_number.apply_to(&mut user.phone_number);
            patch
                .phone_number_confirmed_at
                .apply_to(&mut user.phone_number_confirmed_at);
            patch.last_sign_in.apply_to(&mut user.last_sign_in);
            app_metadata.apply_to(&mut user.app_metadata);
            user_metadata.apply_to(&mut user.user_metadata);
            patch.banned_until.apply_to(&mut user.banned_until);
            user.updated_at = OffsetDateTime::now_utc();
            user.clone()
        };
        row.decode(codec)
            .map_err(|e| UpdateError::Internal(e.to_string()))
    }

    async fn delete_user<C: MetadataCodec>(
        &self,
        key: &UserKey,
        codec: &C,
    ) -> Result<User<C::Value>, DeleteError> {
        let row = {
            let mut tables = self.tables.lock();
            let mut matches = tables.live_user_mut(key);
            match matches.len() {
                0 => return Err(DeleteError::DeletedTooFewRecords),
                1 => {}
                _ => return Err(DeleteError::DeletedTooManyRecords),
            }
            let user: &mut UserRow = &mut matches[0];
            user.deleted_at = Some(OffsetDateTime::now_utc());
            user.clone()
        };
        row.decode(codec)
            .map_err(|e| DeleteError::Internal(e.to_string()))
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<Session, CreateError> {
        let mut tables = self.tables.lock();
        if !tables.live_user_exists(user_id) {
            return Err(CreateError::CreatedTooFewRecords);
        }
        let now = OffsetDateTime::now_utc();
        let session = Session {
            id: Uuid::now_v7(),
            created_at: now,
            expires_at: expiry_from_ttl(now, ttl_seconds),
            user_id,
            ip,
            user_agent: user_agent.map(str::to_string),
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(
        &self,
        session_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, GetError> {
        let session = self
            .tables
            .lock()
            .sessions
            .get(&session_id)
            .filter(|s| s.ip == ip && s.user_agent.as_deref() == user_agent)
            .cloned()
            .ok_or(GetError::TooFewRecords)?;
        if session.is_expired_at(OffsetDateTime::now_utc()) {
            self.reaper.schedule(CleanupJob::DeleteSession(session.id));
            return Err(GetError::TooFewRecords);
        }
        Ok(session)
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), DeleteError> {
        self.tables.lock().sessions.remove(&session_id);
        Ok(())
    }

    async fn create_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        ttl_seconds: u64,
    ) -> Result<String, CreateError> {
        let token = generate_token();
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables.lock();
        if !tables.live_user_exists(user_id) {
            return Err(CreateError::CreatedTooFewRecords);
        }
        for prior in tables
            .tokens
            .iter_mut()
            .filter(|t| t.user_id == user_id && t.token_type == token_type && t.is_live())
        {
            prior.deleted_at = Some(now);
        }
        tables.tokens.push(OneTimeToken {
            id: Uuid::now_v7(),
            created_at: now,
            deleted_at: None,
            expires_at: expires_in(now, ttl_seconds),
            used_at: None,
            token_type,
            user_id,
            token_hash: hash_token(&token),
        });
        Ok(token)
    }

    async fn validate_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), GetError> {
        let token_hash = hash_token(token);
        let now = OffsetDateTime::now_utc();
        let matches: Vec<OneTimeToken> = self
            .tables
            .lock()
            .tokens
            .iter()
            .filter(|t| {
                t.user_id == user_id
                    && t.token_type == token_type
                    && t.token_hash == token_hash
                    && t.is_live()
            })
            .cloned()
            .collect();
        let found = single(matches, GetError::TooFewRecords, GetError::TooManyRecords)?;
        if !found.is_usable_at(now) {
            return Err(GetError::TooFewRecords);
        }
        Ok(())
    }

    async fn use_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
        token: &str,
    ) -> Result<(), UpdateError> {
        let token_hash = hash_token(token);
        let now = OffsetDateTime::now_utc();
        let mut expired = Vec::new();
        let result = {
            let mut tables = self.tables.lock();
            let mut matches: Vec<&mut OneTimeToken> = tables
                .tokens
                .iter_mut()
                .filter(|t| {
                    t.user_id == user_id
                        && t.token_type == token_type
                        && t.token_hash == token_hash
                        && t.is_live()
                })
                .collect();
            expired.extend(
                matches
                    .iter()
                    .filter(|t| t.used_at.is_none() && now >= t.expires_at)
                    .map(|t| t.id),
            );
            matches.retain(|t| t.is_usable_at(now));
            match matches.len() {
                0 => Err(UpdateError::UpdatedTooFewRecords),
                1 => {
                    matches[0].used_at = Some(now);
                    Ok(())
                }
                _ => Err(UpdateError::UpdatedTooManyRecords),
            }
        };
        for id in expired {
            self.reaper.schedule(CleanupJob::RevokeToken(id));
        }
        result
    }

    async fn delete_one_time_token(
        &self,
        user_id: Uuid,
        token_type: TokenType,
    ) -> Result<(), DeleteError> {
        let mut tables = self.tables.lock();
        let mut matches: Vec<&mut OneTimeToken> = tables
            .tokens
            .iter_mut()
            .filter(|t| t.user_id == user_id && t.token_type == token_type && t.is_live())
            .collect();
        match matches.len() {
            0 => Err(DeleteError::DeletedTooFewRecords),
            1 => {
                matches[0].deleted_at = Some(OffsetDateTime::now_utc());
                Ok(())
            }
            _ => Err(DeleteError::DeletedTooManyRecords),
        }
    }

    async fn cache_set(
        &self,
        resource_type: ResourceType,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CreateError> {
        let entry = CacheEntry {
            resource_type: resource_type.as_str().to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expires_at: expiry_from_ttl(OffsetDateTime::now_utc(), ttl_seconds),
        };
        self.tables
            .lock()
            .cache
            .insert((entry.resource_type.clone(), entry.key.clone()), entry);
        Ok(())
    }

    async fn cache_get(
        &self,
        resource_type: ResourceType,
        key: &str,
    ) -> Result<Option<String>, GetError> {
        let entry = self
            .tables
            .lock()
            .cache
            .get(&(resource_type.as_str().to_string(), key.to_string()))
            .cloned();
        match entry {
            Some(e) if e.is_expired_at(OffsetDateTime::now_utc()) => {
                self.reaper.schedule(CleanupJob::DeleteCacheEntry {
                    resource_type,
                    key: key.to_string(),
                });
                Ok(None)
            }
            Some(e) => Ok(Some(e.value)),
            None => Ok(None),
        }
    }

    async fn cache_delete(&self, resource_type: ResourceType, key: &str) -> Result<(), DeleteError> {
        self.tables
            .lock()
            .cache
            .remove(&(resource_type.as_str().to_string(), key.to_string()));
        Ok(())
    }

    fn cleanup_stats(&self) -> ReaperStats {
        self.reaper.stats()
    }
}

#[cfg(test)]
mod tests;
