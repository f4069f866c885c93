use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::metadata::{decode_app_metadata, AppMetadata, CodecError, MetadataCodec};

/// User record, with `user_metadata` decoded by the caller's codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User<M> {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    pub role: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // Argon2 PHC string, never exposed in JSON
    pub email_confirmed_at: Option<OffsetDateTime>,
    pub phone_number: Option<String>,
    pub phone_number_confirmed_at: Option<OffsetDateTime>,
    pub last_sign_in: Option<OffsetDateTime>,
    pub app_metadata: AppMetadata,
    pub user_metadata: M,
    pub banned_until: Option<OffsetDateTime>,
}

impl<M> User<M> {
    pub fn is_banned_at(&self, now: OffsetDateTime) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }
}

/// User row as stored: both metadata columns are JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    pub role: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub email_confirmed_at: Option<OffsetDateTime>,
    pub phone_number: Option<String>,
    pub phone_number_confirmed_at: Option<OffsetDateTime>,
    pub last_sign_in: Option<OffsetDateTime>,
    pub app_metadata: String,
    pub user_metadata: String,
    pub banned_until: Option<OffsetDateTime>,
}

impl UserRow {
    pub fn decode<C: MetadataCodec>(self, codec: &C) -> Result<User<C::Value>, CodecError> {
        Ok(User {
            app_metadata: decode_app_metadata(&self.app_metadata)?,
            user_metadata: codec.decode(&self.user_metadata)?,
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            role: self.role,
            email: self.email,
            password_hash: self.password_hash,
            email_confirmed_at: self.email_confirmed_at,
            phone_number: self.phone_number,
            phone_number_confirmed_at: self.phone_number_confirmed_at,
            last_sign_in: self.last_sign_in,
            banned_until: self.banned_until,
        })
    }
}

/// Values for a new user. `password` is plaintext; the store hashes it.
#[derive(Debug, Clone)]
pub struct UserInsert<M> {
    pub role: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub email_confirmed_at: Option<OffsetDateTime>,
    pub phone_number: Option<String>,
    pub phone_number_confirmed_at: Option<OffsetDateTime>,
    pub app_metadata: AppMetadata,
    pub user_metadata: M,
}

impl<M> UserInsert<M> {
    pub fn new(user_metadata: M) -> Self {
        Self {
            role: None,
            email: None,
            password: None,
            email_confirmed_at: None,
            phone_number: None,
            phone_number_confirmed_at: None,
            app_metadata: AppMetadata::new(),
            user_metadata,
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn app_metadata(mut self, app_metadata: AppMetadata) -> Self {
        self.app_metadata = app_metadata;
        self
    }
}

/// One field of a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    Set(T),
    #[default]
    Ignore,
}

impl<T> Patch<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Ignore => None,
        }
    }

    /// Writes the patched value into `slot`, leaving it alone on `Ignore`.
    pub fn apply_to(self, slot: &mut T) {
        if let Self::Set(value) = self {
            *slot = value;
        }
    }
}

/// Partial update of a user. Only `Set` fields are written; `updated_at`
/// is refreshed regardless.
#[derive(Debug, Clone)]
pub struct UserPatch<M> {
    pub role: Patch<Option<String>>,
    pub email: Patch<Option<String>>,
    /// Plaintext; `Set(None)` clears the stored hash.
    pub password: Patch<Option<String>>,
    pub email_confirmed_at: Patch<Option<OffsetDateTime>>,
    pub phone_number: Patch<Option<String>>,
    pub phone_number_confirmed_at: Patch<Option<OffsetDateTime>>,
    pub last_sign_in: Patch<Option<OffsetDateTime>>,
    pub app_metadata: Patch<AppMetadata>,
    pub user_metadata: Patch<M>,
    pub banned_until: Patch<Option<OffsetDateTime>>,
}

impl<M> Default for UserPatch<M> {
    fn default() -> Self {
        Self {
            role: Patch::Ignore,
            email: Patch::Ignore,
            password: Patch::Ignore,
            email_confirmed_at: Patch::Ignore,
            phone_number: Patch::Ignore,
            phone_number_confirmed_at: Patch::Ignore,
            last_sign_in: Patch::Ignore,
            app_metadata: Patch::Ignore,
            user_metadata: Patch::Ignore,
            banned_until: Patch::Ignore,
        }
    }
}

impl<M> UserPatch<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: Option<String>) -> Self {
        self.role = Patch::Set(role);
        self
    }

    pub fn email(mut self, email: Option<String>) -> Self {
        self.email = Patch::Set(email);
        self
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = Patch::Set(password);
        self
    }

    pub fn email_confirmed_at(mut self, at: Option<OffsetDateTime>) -> Self {
        self.email_confirmed_at = Patch::Set(at);
        self
    }

    pub fn phone_number(mut self, phone_number: Option<String>) -> Self {
        self.phone_number = Patch::Set(phone_number);
        self
    }

    pub fn phone_number_confirmed_at(mut self, at: Option<OffsetDateTime>) -> Self {
        self.phone_number_confirmed_at = Patch::Set(at);
        self
    }

    pub fn last_sign_in(mut self, at: Option<OffsetDateTime>) -> Self {
        self.last_sign_in = Patch::Set(at);
        self
    }

    pub fn app_metadata(mut self, app_metadata: AppMetadata) -> Self {
        self.app_metadata = Patch::Set(app_metadata);
        self
    }

    pub fn user_metadata(mut self, user_metadata: M) -> Self {
        self.user_metadata = Patch::Set(user_metadata);
        self
    }

    pub fn banned_until(mut self, until: Option<OffsetDateTime>) -> Self {
        self.banned_until = Patch::Set(until);
        self
    }
}

/// Column and value identifying the user an update or delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserKey {
    Id(Uuid),
    Email(String),
    PhoneNumber(String),
}

impl UserKey {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::Email(_) => "email",
            Self::PhoneNumber(_) => "phone_number",
        }
    }
}

/// LIKE-pattern predicates for listing users. Present fields are OR-ed;
/// absent fields contribute nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilters {
    pub id: Option<Vec<String>>,
    pub email: Option<Vec<String>>,
    pub phone_number: Option<Vec<String>>,
}

impl UserFilters {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none() && self.phone_number.is_none()
    }

    /// Exact match on one key, with LIKE wildcards in the value escaped.
    pub fn exact(key: &UserKey) -> Self {
        match key {
            UserKey::Id(id) => Self {
                id: Some(vec![id.to_string()]),
                ..Default::default()
            },
            UserKey::Email(email) => Self {
                email: Some(vec![escape_like(email)]),
                ..Default::default()
            },
            UserKey::PhoneNumber(phone) => Self {
                phone_number: Some(vec![escape_like(phone)]),
                ..Default::default()
            },
        }
    }
}

/// Escapes `%`, `_` and `\` so the value matches only itself under LIKE.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Bearer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    /// `None` means the session never expires.
    pub expires_at: Option<OffsetDateTime>,
    pub user_id: Uuid,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub user_id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = std::net::AddrParseError;

    fn try_from(r: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            ip: r.ip.as_deref().map(IpAddr::from_str).transpose()?,
            id: r.id,
            created_at: r.created_at,
            expires_at: r.expires_at,
            user_id: r.user_id,
            user_agent: r.user_agent,
        })
    }
}

/// Kind of action a one-time token authorises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    PasswordReset,
    EmailConfirmation,
    PhoneConfirmation,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::EmailConfirmation => "email_confirmation",
            Self::PhoneConfirmation => "phone_confirmation",
        }
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password_reset" => Ok(Self::PasswordReset),
            "email_confirmation" => Ok(Self::EmailConfirmation),
            "phone_confirmation" => Ok(Self::PhoneConfirmation),
            other => Err(format!("unknown token type: {other}")),
        }
    }
}

/// Stored one-time token. Only the hash of the raw token is kept.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OneTimeToken {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub used_at: Option<OffsetDateTime>,
    #[sqlx(try_from = "String")]
    pub token_type: TokenType,
    pub user_id: Uuid,
    pub token_hash: String,
}

impl TryFrom<String> for TokenType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl OneTimeToken {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        self.is_live() && self.used_at.is_none() && now < self.expires_at
    }
}

/// Longest TTL honoured; larger values are clamped to it (about 100 years).
pub const MAX_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// `now + ttl_seconds`, clamped to [`MAX_TTL_SECONDS`] and to the last
/// representable instant.
pub(crate) fn expires_in(now: OffsetDateTime, ttl_seconds: u64) -> OffsetDateTime {
    let ttl = Duration::seconds(ttl_seconds.min(MAX_TTL_SECONDS) as i64);
    now.checked_add(ttl)
        .unwrap_or_else(|| Date::MAX.midnight().assume_utc())
}

/// [`expires_in`], or `None` for no expiry.
pub(crate) fn expiry_from_ttl(now: OffsetDateTime, ttl_seconds: Option<u64>) -> Option<OffsetDateTime> {
    ttl_seconds.map(|ttl| expires_in(now, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_like_neutralises_wildcards() {
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(escape_like("lucy@example.dev"), "lucy@example.dev");
    }

    #[test]
    fn patch_apply_only_writes_set_values() {
        let mut slot = Some("old".to_string());
        Patch::Ignore.apply_to(&mut slot);
        assert_eq!(slot.as_deref(), Some("old"));
        Patch::Set(None).apply_to(&mut slot);
        assert_eq!(slot, None);
    }

    #[test]
    fn default_patch_sets_nothing() {
        let patch = UserPatch::<()>::default();
        assert!(!patch.email.is_set());
        assert!(!patch.password.is_set());
        assert!(!patch.user_metadata.is_set());
        assert!(patch.email("a@b.c".to_string().into()).email.is_set());
    }

    #[test]
    fn session_expiry_is_exclusive_of_deadline() {
        let now = OffsetDateTime::now_utc();
        let mut session = Session {
            id: Uuid::now_v7(),
            created_at: now,
            expires_at: None,
            user_id: Uuid::now_v7(),
            ip: None,
            user_agent: None,
        };
        assert!(!session.is_expired_at(now));
        session.expires_at = Some(now);
        assert!(session.is_expired_at(now));
        session.expires_at = Some(now + Duration::seconds(1));
        assert!(!session.is_expired_at(now));
    }

    #[test]
    fn huge_ttl_is_clamped_instead_of_overflowing() {
        let now = OffsetDateTime::now_utc();
        let capped = now + Duration::seconds(MAX_TTL_SECONDS as i64);
        assert_eq!(expires_in(now, u64::MAX), capped);
        assert_eq!(expiry_from_ttl(now, Some(100_000_000_000_000)), Some(capped));
        assert_eq!(expiry_from_ttl(now, Some(60)), Some(now + Duration::seconds(60)));
        assert_eq!(expiry_from_ttl(now, None), None);

        let near_end = Date::MAX.midnight().assume_utc() - Duration::days(1);
        assert_eq!(expires_in(near_end, u64::MAX), Date::MAX.midnight().assume_utc());
    }

    #[test]
    fn session_row_rejects_unparseable_ip() {
        let row = SessionRow {
            id: Uuid::now_v7(),
            created_at: OffsetDateTime::now_utc(),
            expires_at: None,
            user_id: Uuid::now_v7(),
            ip: Some("not-an-ip".into()),
            user_agent: None,
        };
        assert!(Session::try_from(row).is_err());
    }

    #[test]
    fn token_type_text_roundtrip() {
        for t in [
            TokenType::PasswordReset,
            TokenType::EmailConfirmation,
            TokenType::PhoneConfirmation,
        ] {
            assert_eq!(t.as_str().parse::<TokenType>().unwrap(), t);
        }
        assert!("magic_link".parse::<TokenType>().is_err());
    }

    #[test]
    fn exact_filter_uses_single_escaped_pattern() {
        let filters = UserFilters::exact(&UserKey::Email("x_y@example.dev".into()));
        assert_eq!(filters.email, Some(vec!["x\\_y@example.dev".to_string()]));
        assert!(filters.id.is_none());
        assert!(UserFilters::default().is_empty());
    }
}
