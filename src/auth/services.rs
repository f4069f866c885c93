use std::net::IpAddr;

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::cookie::{self, CookieError};
use crate::auth::password::verify_password;
use crate::auth::repo_types::{Session, TokenType, User, UserFilters, UserInsert, UserKey, UserPatch};
use crate::cache::ResourceType;
use crate::driver::Store;
use crate::error::{single, CreateError, DeleteError, GetError, UpdateError};
use crate::metadata::MetadataCodec;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 14;
pub const DEFAULT_PASSWORD_RESET_TTL_SECS: u64 = 60 * 60;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email")]
    InvalidEmail,

    #[error("password too short")]
    WeakPassword,

    /// Unknown email and wrong password are deliberately indistinguishable.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user is banned")]
    Banned,

    #[error(transparent)]
    Cookie(#[from] CookieError),

    #[error(transparent)]
    Get(#[from] GetError),

    #[error(transparent)]
    Create(#[from] CreateError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Delete(#[from] DeleteError),
}

/// Raw reset token for out-of-band delivery to the user.
#[derive(Debug, Clone)]
pub struct PasswordResetTicket {
    pub user_id: Uuid,
    pub token: String,
}

/// Account, session and cache operations over one connected store.
pub struct AuthService<S, C> {
    store: S,
    codec: C,
    cookie_secret: Vec<u8>,
    session_ttl: Option<u64>,
    password_reset_ttl: u64,
}

impl<S: Store, C: MetadataCodec> AuthService<S, C> {
    pub fn new(store: S, codec: C, cookie_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            codec,
            cookie_secret: cookie_secret.into(),
            session_ttl: Some(DEFAULT_SESSION_TTL_SECS),
            password_reset_ttl: DEFAULT_PASSWORD_RESET_TTL_SECS,
        }
    }

    /// `None` issues sessions that never expire.
    pub fn session_ttl(mut self, ttl_seconds: Option<u64>) -> Self {
        self.session_ttl = ttl_seconds;
        self
    }

    pub fn password_reset_ttl(mut self, ttl_seconds: u64) -> Self {
        self.password_reset_ttl = ttl_seconds;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    #[instrument(skip_all)]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        user_metadata: C::Value,
    ) -> Result<User<C::Value>, AuthError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            warn!(%email, "invalid email");
            return Err(AuthError::InvalidEmail);
        }
        if password.len() < MIN_PASSWORD_LEN {
            warn!("password too short");
            return Err(AuthError::WeakPassword);
        }

        let user = self
            .store
            .create_user(
                UserInsert::new(user_metadata).email(email).password(password),
                &self.codec,
            )
            .await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Exactly one live user for `key`. Fetches at most two rows so a
    /// duplicate shows up as `TooManyRecords` instead of an arbitrary pick.
    #[instrument(skip(self))]
    pub async fn get_user(&self, key: &UserKey) -> Result<User<C::Value>, GetError> {
        let key = match key {
            UserKey::Email(email) => UserKey::Email(normalize_email(email)),
            other => other.clone(),
        };
        let users = self
            .store
            .list_users(2, 0, &UserFilters::exact(&key), &self.codec)
            .await?;
        single(users, GetError::TooFewRecords, GetError::TooManyRecords)
    }

    #[instrument(skip(self, password))]
    pub async fn get_user_by_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<User<C::Value>, AuthError> {
        let user = match self.get_user(&UserKey::Email(email.to_string())).await {
            Ok(user) => user,
            Err(GetError::TooFewRecords) => {
                warn!("login unknown email");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };
        if !verify_password(password, user.password_hash.as_deref()) {
            warn!(user_id = %user.id, "password mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }

    #[instrument(skip(self, patch))]
    pub async fn update_user(
        &self,
        key: &UserKey,
        patch: UserPatch<C::Value>,
    ) -> Result<User<C::Value>, UpdateError> {
        self.store.update_user(key, patch, &self.codec).await
    }

    /// Requires the current password before setting a new one.
    #[instrument(skip(self, current, new))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        if new.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let user = self.get_user(&UserKey::Id(user_id)).await?;
        if !verify_password(current, user.password_hash.as_deref()) {
            warn!(%user_id, "password change with wrong current password");
            return Err(AuthError::InvalidCredentials);
        }
        self.store
            .update_user(
                &UserKey::Id(user_id),
                UserPatch::new().password(Some(new.to_string())),
                &self.codec,
            )
            .await?;
        info!(%user_id, "password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_user(&self, key: &UserKey) -> Result<User<C::Value>, DeleteError> {
        let user = self.store.delete_user(key, &self.codec).await?;
        info!(user_id = %user.id, "user deleted");
        Ok(user)
    }

    /// Checks credentials, records the sign-in and opens a session.
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<(User<C::Value>, Session), AuthError> {
        let user = self.get_user_by_email_and_password(email, password).await?;
        let now = OffsetDateTime::now_utc();
        if user.is_banned_at(now) {
            warn!(user_id = %user.id, "banned user login");
            return Err(AuthError::Banned);
        }

        let user = self
            .store
            .update_user(
                &UserKey::Id(user.id),
                UserPatch::new().last_sign_in(Some(now)),
                &self.codec,
            )
            .await?;
        let session = self.issue_session(user.id, ip, user_agent).await?;
        info!(user_id = %user.id, session_id = %session.id, "user logged in");
        Ok((user, session))
    }

    #[instrument(skip(self))]
    pub async fn issue_session(
        &self,
        user_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, CreateError> {
        self.store
            .create_session(user_id, ip, user_agent, self.session_ttl)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_session(
        &self,
        session_id: Uuid,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, GetError> {
        self.store.get_session(session_id, ip, user_agent).await
    }

    #[instrument(skip(self))]
    pub async fn logout(&self, session_id: Uuid) -> Result<(), DeleteError> {
        self.store.delete_session(session_id).await?;
        debug!(%session_id, "session closed");
        Ok(())
    }

    pub fn session_cookie(&self, session: &Session) -> String {
        cookie::sign(&session.id.to_string(), &self.cookie_secret)
    }

    /// Verifies the cookie signature, then loads the session it names.
    #[instrument(skip(self, cookie))]
    pub async fn session_from_cookie(
        &self,
        cookie: &str,
        ip: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> Result<Session, AuthError> {
        let session_id = cookie::verify(cookie, &self.cookie_secret).map_err(|e| {
            warn!(error = %e, "rejected session cookie");
            e
        })?;
        let session_id = Uuid::parse_str(session_id).map_err(|_| CookieError::Malformed)?;
        Ok(self.store.get_session(session_id, ip, user_agent).await?)
    }

    #[instrument(skip(self))]
    pub async fn request_password_reset(&self, email: &str) -> Result<PasswordResetTicket, AuthError> {
        let user = self.get_user(&UserKey::Email(email.to_string())).await?;
        let token = self
            .store
            .create_one_time_token(user.id, TokenType::PasswordReset, self.password_reset_ttl)
            .await?;
        info!(user_id = %user.id, "password reset requested");
        Ok(PasswordResetTicket {
            user_id: user.id,
            token,
        })
    }

    /// Checks the reset token, sets the new password, then consumes the
    /// token. A failed update leaves the token usable.
    #[instrument(skip(self, token, new_password))]
    pub async fn reset_password(
        &self,
        user_id: Uuid,
        token: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        self.store
            .validate_one_time_token(user_id, TokenType::PasswordReset, token)
            .await?;
        self.store
            .update_user(
                &UserKey::Id(user_id),
                UserPatch::new().password(Some(new_password.to_string())),
                &self.codec,
            )
            .await?;
        self.store
            .use_one_time_token(user_id, TokenType::PasswordReset, token)
            .await?;
        info!(%user_id, "password reset");
        Ok(())
    }

    pub async fn cache_set(
        &self,
        resource_type: ResourceType,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CreateError> {
        self.store.cache_set(resource_type, key, value, ttl_seconds).await
    }

    pub async fn cache_get(
        &self,
        resource_type: ResourceType,
        key: &str,
    ) -> Result<Option<String>, GetError> {
        self.store.cache_get(resource_type, key).await
    }

    pub async fn cache_delete(&self, resource_type: ResourceType, key: &str) -> Result<(), DeleteError> {
        self.store.cache_delete(resource_type, key).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::driver::{Driver, MemoryDriver, MemoryStore};
    use crate::metadata::JsonCodec;

    const SECRET: &[u8] = b"test-cookie-secret";

    async fn service() -> AuthService<MemoryStore, JsonCodec<Value>> {
        let store = MemoryDriver::new().connect().await.unwrap();
        AuthService::new(store, JsonCodec::new(), SECRET)
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("lucy@example.dev"));
        assert!(!is_valid_email("lucy@example"));
        assert!(!is_valid_email("lucy example.dev"));
    }

    #[tokio::test]
    async fn register_then_login_yields_same_user() {
        let auth = service().await;
        let created = auth
            .register(" Lucy@Example.dev ", "secret123", json!({"theme": "dark"}))
            .await
            .unwrap();
        assert_eq!(created.email.as_deref(), Some("lucy@example.dev"));

        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let (user, session) = auth
            .login("lucy@example.dev", "secret123", Some(ip), Some("firefox"))
            .await
            .unwrap();
        assert_eq!(user.id, created.id);
        assert!(user.last_sign_in.is_some());
        assert_eq!(session.user_id, created.id);
        assert!(session.expires_at.is_some());

        let cookie = auth.session_cookie(&session);
        let restored = auth
            .session_from_cookie(&cookie, Some(ip), Some("firefox"))
            .await
            .unwrap();
        assert_eq!(restored, session);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let auth = service().await;
        auth.register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        assert!(matches!(
            auth.login("lucy@example.dev", "secret124", None, None).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("nobody@example.dev", "secret123", None, None).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let auth = service().await;
        assert!(matches!(
            auth.register("not-an-email", "secret123", json!({})).await,
            Err(AuthError::InvalidEmail)
        ));
        assert!(matches!(
            auth.register("lucy@example.dev", "short", json!({})).await,
            Err(AuthError::WeakPassword)
        ));
    }

    #[tokio::test]
    async fn exact_lookup_does_not_treat_input_as_pattern() {
        let auth = service().await;
        auth.register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        assert!(auth
            .get_user(&UserKey::Email("%@example.dev".into()))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(auth
            .get_user(&UserKey::Email("lucy@example.dev".into()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn banned_user_cannot_log_in() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        auth.update_user(
            &UserKey::Id(user.id),
            UserPatch::new().banned_until(Some(OffsetDateTime::now_utc() + time::Duration::hours(1))),
        )
        .await
        .unwrap();
        assert!(matches!(
            auth.login("lucy@example.dev", "secret123", None, None).await,
            Err(AuthError::Banned)
        ));
    }

    #[tokio::test]
    async fn tampered_cookie_is_rejected() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        let session = auth.issue_session(user.id, None, None).await.unwrap();
        let cookie = auth.session_cookie(&session);

        let other = AuthService::new(auth.into_store(), JsonCodec::<Value>::new(), b"other".to_vec());
        assert!(matches!(
            other.session_from_cookie(&cookie, None, None).await,
            Err(AuthError::Cookie(CookieError::BadSignature))
        ));
        let forged = cookie::sign("not-a-uuid", b"other");
        assert!(matches!(
            other.session_from_cookie(&forged, None, None).await,
            Err(AuthError::Cookie(CookieError::Malformed))
        ));
    }

    #[tokio::test]
    async fn logout_ends_session() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        let session = auth.issue_session(user.id, None, None).await.unwrap();
        auth.logout(session.id).await.unwrap();
        assert!(auth
            .get_session(session.id, None, None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn password_reset_flow() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        let ticket = auth.request_password_reset("lucy@example.dev").await.unwrap();
        assert_eq!(ticket.user_id, user.id);

        auth.reset_password(user.id, &ticket.token, "brand-new-pass")
            .await
            .unwrap();
        assert!(auth
            .get_user_by_email_and_password("lucy@example.dev", "brand-new-pass")
            .await
            .is_ok());
        assert!(matches!(
            auth.reset_password(user.id, &ticket.token, "another-pass").await,
            Err(AuthError::Get(GetError::TooFewRecords))
        ));
    }

    #[tokio::test]
    async fn failed_reset_keeps_token_unused() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        let ticket = auth.request_password_reset("lucy@example.dev").await.unwrap();
        auth.delete_user(&UserKey::Id(user.id)).await.unwrap();

        assert!(matches!(
            auth.reset_password(user.id, &ticket.token, "brand-new-pass").await,
            Err(AuthError::Update(UpdateError::UpdatedTooFewRecords))
        ));
        auth.store()
            .validate_one_time_token(user.id, TokenType::PasswordReset, &ticket.token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn change_password_requires_current() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        assert!(matches!(
            auth.change_password(user.id, "wrong-one", "n3w-secret").await,
            Err(AuthError::InvalidCredentials)
        ));
        auth.change_password(user.id, "secret123", "n3w-secret")
            .await
            .unwrap();
        assert!(auth
            .get_user_by_email_and_password("lucy@example.dev", "n3w-secret")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn deleted_user_is_gone_and_cache_passes_through() {
        let auth = service().await;
        let user = auth
            .register("lucy@example.dev", "secret123", json!({}))
            .await
            .unwrap();
        auth.delete_user(&UserKey::Id(user.id)).await.unwrap();
        assert!(auth
            .get_user(&UserKey::Id(user.id))
            .await
            .unwrap_err()
            .is_not_found());

        auth.cache_set(ResourceType::EMAIL_CHALLENGE, "lucy", "123456", Some(300))
            .await
            .unwrap();
        assert_eq!(
            auth.cache_get(ResourceType::EMAIL_CHALLENGE, "lucy")
                .await
                .unwrap()
                .as_deref(),
            Some("123456")
        );
        auth.cache_delete(ResourceType::EMAIL_CHALLENGE, "lucy")
            .await
            .unwrap();
    }
}
