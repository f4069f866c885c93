use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::*;
use crate::auth::password::verify_password;
use crate::metadata::JsonCodec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct Profile {
    display_name: String,
}

const CODEC: JsonCodec<Profile> = JsonCodec::new();

fn profile(name: &str) -> Profile {
    Profile {
        display_name: name.into(),
    }
}

async fn connected() -> MemoryStore {
    MemoryDriver::new().connect().await.unwrap()
}

async fn lucy(store: &MemoryStore) -> User<Profile> {
    store
        .create_user(
            UserInsert::new(profile("Lucy"))
                .email("lucy@example.dev")
                .password("secret123"),
            &CODEC,
        )
        .await
        .unwrap()
}

#[test]
fn like_match_handles_wildcards_and_escapes() {
    assert!(like_match("lucy@example.dev", "lucy@example.dev"));
    assert!(like_match("%@example.dev", "lucy@example.dev"));
    assert!(like_match("l_cy%", "lucy@example.dev"));
    assert!(!like_match("l_cy", "lucy@example.dev"));
    assert!(like_match("%", ""));
    assert!(!like_match("_", ""));
    assert!(like_match("a\\_b", "a_b"));
    assert!(!like_match("a\\_b", "axb"));
    assert!(like_match("100\\%", "100%"));
    assert!(!like_match("100\\%", "1000"));
}

#[tokio::test]
async fn created_user_is_listed_with_hashed_password() {
    let store = connected().await;
    let created = lucy(&store).await;

    let found = store
        .list_users(2, 0, &UserFilters::exact(&UserKey::Email("lucy@example.dev".into())), &CODEC)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, created.id);
    assert_eq!(found[0].user_metadata, profile("Lucy"));

    let hash = found[0].password_hash.as_deref();
    assert_ne!(hash, Some("secret123"));
    assert!(verify_password("secret123", hash));
    assert!(!verify_password("secret124", hash));
}

#[tokio::test]
async fn filters_are_or_combined_and_skip_deleted() {
    let store = connected().await;
    let a = lucy(&store).await;
    let b = store
        .create_user(
            UserInsert::new(profile("Ben")).phone_number("+15550100"),
            &CODEC,
        )
        .await
        .unwrap();
    store
        .create_user(UserInsert::new(profile("Cat")).email("cat@other.dev"), &CODEC)
        .await
        .unwrap();

    let filters = UserFilters {
        email: Some(vec!["%@example.dev".into()]),
        phone_number: Some(vec!["+1555%".into()]),
        ..Default::default()
    };
    let mut ids: Vec<Uuid> = store
        .list_users(10, 0, &filters, &CODEC)
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.id)
        .collect();
    ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);

    store.delete_user(&UserKey::Id(a.id), &CODEC).await.unwrap();
    let all = store
        .list_users(10, 0, &UserFilters::default(), &CODEC)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|u| u.id != a.id));
}

#[tokio::test]
async fn listing_is_ordered_and_paged() {
    let store = connected().await;
    for name in ["a", "b", "c"] {
        store
            .create_user(UserInsert::new(profile(name)), &CODEC)
            .await
            .unwrap();
    }
    let all = store
        .list_users(10, 0, &UserFilters::default(), &CODEC)
        .await
        .unwrap();
    let page = store
        .list_users(1, 1, &UserFilters::default(), &CODEC)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, all[1].id);
}

#[tokio::test]
async fn live_email_must_be_unique_but_deleted_frees_it() {
    let store = connected().await;
    let first = lucy(&store).await;
    let err = store
        .create_user(UserInsert::new(profile("Imposter")).email("lucy@example.dev"), &CODEC)
        .await
        .unwrap_err();
    assert!(matches!(err, CreateError::Driver(ref e) if e.is_unique_violation()));

    store.delete_user(&UserKey::Id(first.id), &CODEC).await.unwrap();
    let second = lucy(&store).await;
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn ignore_only_patch_changes_nothing_but_updated_at() {
    let store = connected().await;
    let before = lucy(&store).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let after = store
        .update_user(&UserKey::Id(before.id), UserPatch::new(), &CODEC)
        .await
        .unwrap();
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.email, before.email);
    assert_eq!(after.password_hash, before.password_hash);
    assert_eq!(after.user_metadata, before.user_metadata);
    assert_eq!(after.created_at, before.created_at);
}

#[tokio::test]
async fn patch_sets_clears_and_rehashes() {
    let store = connected().await;
    let user = lucy(&store).await;

    let updated = store
        .update_user(
            &UserKey::Email("lucy@example.dev".into()),
            UserPatch::new()
                .phone_number(Some("+15550199".into()))
                .role(Some("admin".into()))
                .password(Some("n3w-secret".into()))
                .user_metadata(profile("Lucy L.")),
            &CODEC,
        )
        .await
        .unwrap();
    assert_eq!(updated.id, user.id);
    assert_eq!(updated.phone_number.as_deref(), Some("+15550199"));
    assert_eq!(updated.role.as_deref(), Some("admin"));
    assert_eq!(updated.user_metadata.display_name, "Lucy L.");
    assert!(verify_password("n3w-secret", updated.password_hash.as_deref()));
    assert!(!verify_password("secret123", updated.password_hash.as_deref()));

    let cleared = store
        .update_user(&UserKey::Id(user.id), UserPatch::new().role(None), &CODEC)
        .await
        .unwrap();
    assert_eq!(cleared.role, None);
    assert_eq!(cleared.phone_number.as_deref(), Some("+15550199"));
}

#[tokio::test]
async fn update_and_delete_report_missing_rows() {
    let store = connected().await;
    let missing = UserKey::Email("nobody@example.dev".into());
    assert!(matches!(
        store.update_user(&missing, UserPatch::new(), &CODEC).await,
        Err(UpdateError::UpdatedTooFewRecords)
    ));
    assert!(matches!(
        store.delete_user(&missing, &CODEC).await,
        Err(DeleteError::DeletedTooFewRecords)
    ));

    let user = lucy(&store).await;
    let deleted = store.delete_user(&UserKey::Id(user.id), &CODEC).await.unwrap();
    assert!(deleted.deleted_at.is_some());
    assert!(matches!(
        store.delete_user(&UserKey::Id(user.id), &CODEC).await,
        Err(DeleteError::DeletedTooFewRecords)
    ));
}

#[tokio::test]
async fn session_matches_on_exact_ip_and_agent_shape() {
    let store = connected().await;
    let user = lucy(&store).await;
    let ip: IpAddr = "203.0.113.7".parse().unwrap();

    let with_ip = store
        .create_session(user.id, Some(ip), None, Some(3600))
        .await
        .unwrap();
    assert!(store.get_session(with_ip.id, Some(ip), None).await.is_ok());
    assert!(store
        .get_session(with_ip.id, None, None)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .get_session(with_ip.id, Some(ip), Some("curl/8"))
        .await
        .unwrap_err()
        .is_not_found());

    let bare = store.create_session(user.id, None, None, None).await.unwrap();
    assert_eq!(bare.expires_at, None);
    assert!(store.get_session(bare.id, None, None).await.is_ok());
    assert!(store
        .get_session(bare.id, Some(ip), None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn session_requires_live_user() {
    let store = connected().await;
    assert!(matches!(
        store.create_session(Uuid::now_v7(), None, None, None).await,
        Err(CreateError::CreatedTooFewRecords)
    ));
}

#[tokio::test]
async fn expired_session_reads_as_missing_and_is_reaped() {
    let store = connected().await;
    let user = lucy(&store).await;
    let session = store
        .create_session(user.id, None, None, Some(0))
        .await
        .unwrap();
    assert_eq!(store.session_count(), 1);

    let err = store.get_session(session.id, None, None).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.cleanup_stats().enqueued, 1);

    let tables = store.tables.clone();
    store.disconnect().await.unwrap();
    assert!(tables.lock().sessions.is_empty());
}

#[tokio::test]
async fn delete_session_is_idempotent() {
    let store = connected().await;
    let user = lucy(&store).await;
    let session = store.create_session(user.id, None, None, None).await.unwrap();
    store.delete_session(session.id).await.unwrap();
    store.delete_session(session.id).await.unwrap();
    assert!(store
        .get_session(session.id, None, None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn token_is_stored_hashed_and_usable_once() {
    let store = connected().await;
    let user = lucy(&store).await;
    let token = store
        .create_one_time_token(user.id, TokenType::PasswordReset, 600)
        .await
        .unwrap();
    assert_eq!(token.len(), 64);
    assert!(store.tokens().iter().all(|t| t.token_hash != token));

    store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .unwrap();
    // validation does not consume
    store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .unwrap();

    store
        .use_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .unwrap();
    assert!(matches!(
        store
            .use_one_time_token(user.id, TokenType::PasswordReset, &token)
            .await,
        Err(UpdateError::UpdatedTooFewRecords)
    ));
    assert!(store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn token_is_scoped_to_user_and_type() {
    let store = connected().await;
    let user = lucy(&store).await;
    let token = store
        .create_one_time_token(user.id, TokenType::EmailConfirmation, 600)
        .await
        .unwrap();
    assert!(store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .is_err());
    assert!(store
        .validate_one_time_token(Uuid::now_v7(), TokenType::EmailConfirmation, &token)
        .await
        .is_err());
    assert!(store
        .validate_one_time_token(user.id, TokenType::EmailConfirmation, "deadbeef")
        .await
        .is_err());
}

#[tokio::test]
async fn new_token_replaces_previous_live_one() {
    let store = connected().await;
    let user = lucy(&store).await;
    let first = store
        .create_one_time_token(user.id, TokenType::PasswordReset, 600)
        .await
        .unwrap();
    let second = store
        .create_one_time_token(user.id, TokenType::PasswordReset, 600)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &first)
        .await
        .is_err());
    store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &second)
        .await
        .unwrap();
    assert_eq!(store.tokens().iter().filter(|t| t.is_live()).count(), 1);
}

#[tokio::test]
async fn expired_token_fails_and_is_revoked_on_use() {
    let store = connected().await;
    let user = lucy(&store).await;
    let token = store
        .create_one_time_token(user.id, TokenType::PhoneConfirmation, 0)
        .await
        .unwrap();
    assert!(store
        .validate_one_time_token(user.id, TokenType::PhoneConfirmation, &token)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        store
            .use_one_time_token(user.id, TokenType::PhoneConfirmation, &token)
            .await,
        Err(UpdateError::UpdatedTooFewRecords)
    ));

    let tables = store.tables.clone();
    store.disconnect().await.unwrap();
    assert!(tables.lock().tokens.iter().all(|t| t.deleted_at.is_some()));
}

#[tokio::test]
async fn delete_token_revokes_live_token() {
    let store = connected().await;
    let user = lucy(&store).await;
    let token = store
        .create_one_time_token(user.id, TokenType::PasswordReset, 600)
        .await
        .unwrap();
    store
        .delete_one_time_token(user.id, TokenType::PasswordReset)
        .await
        .unwrap();
    assert!(store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .is_err());
    assert!(matches!(
        store
            .delete_one_time_token(user.id, TokenType::PasswordReset)
            .await,
        Err(DeleteError::DeletedTooFewRecords)
    ));
}

#[tokio::test]
async fn cache_upserts_and_namespaces() {
    let store = connected().await;
    store
        .cache_set(ResourceType::RATE_LIMIT, "ip:1", "1", None)
        .await
        .unwrap();
    store
        .cache_set(ResourceType::RATE_LIMIT, "ip:1", "2", Some(60))
        .await
        .unwrap();
    assert_eq!(
        store
            .cache_get(ResourceType::RATE_LIMIT, "ip:1")
            .await
            .unwrap()
            .as_deref(),
        Some("2")
    );
    assert_eq!(
        store.cache_get(ResourceType::SESSION, "ip:1").await.unwrap(),
        None
    );
    assert_eq!(store.cache_len(), 1);

    store
        .cache_delete(ResourceType::RATE_LIMIT, "ip:1")
        .await
        .unwrap();
    store
        .cache_delete(ResourceType::RATE_LIMIT, "ip:1")
        .await
        .unwrap();
    assert_eq!(store.cache_len(), 0);
}

#[tokio::test]
async fn expired_cache_entry_is_absent_and_reaped() {
    let store = connected().await;
    store
        .cache_set(ResourceType::EMAIL_CHALLENGE, "lucy", "482913", Some(0))
        .await
        .unwrap();
    assert_eq!(
        store
            .cache_get(ResourceType::EMAIL_CHALLENGE, "lucy")
            .await
            .unwrap(),
        None
    );
    let tables = store.tables.clone();
    let stats = store.cleanup_stats();
    assert_eq!(stats.enqueued, 1);
    store.disconnect().await.unwrap();
    assert!(tables.lock().cache.is_empty());
}

#[tokio::test]
async fn reaper_keeps_entry_refreshed_after_expiry() {
    let store = connected().await;
    store
        .cache_set(ResourceType::SESSION, "k", "old", Some(0))
        .await
        .unwrap();
    assert_eq!(store.cache_get(ResourceType::SESSION, "k").await.unwrap(), None);
    store
        .cache_set(ResourceType::SESSION, "k", "new", None)
        .await
        .unwrap();
    let tables = store.tables.clone();
    store.disconnect().await.unwrap();
    let tables = tables.lock();
    let entry = tables
        .cache
        .get(&("session".to_string(), "k".to_string()))
        .expect("refreshed entry survives cleanup");
    assert_eq!(entry.value, "new");
}

#[tokio::test]
async fn session_with_one_second_ttl_is_gone_after_two() {
    let store = connected().await;
    let user = lucy(&store).await;
    let session = store
        .create_session(user.id, None, None, Some(1))
        .await
        .unwrap();
    assert!(store.get_session(session.id, None, None).await.is_ok());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store
        .get_session(session.id, None, None)
        .await
        .unwrap_err()
        .is_not_found());

    let tables = store.tables.clone();
    store.disconnect().await.unwrap();
    assert!(!tables.lock().sessions.contains_key(&session.id));
}

#[tokio::test]
async fn oversized_ttls_are_clamped() {
    use crate::auth::repo_types::MAX_TTL_SECONDS;

    let store = connected().await;
    let user = lucy(&store).await;
    let limit = OffsetDateTime::now_utc() + time::Duration::seconds(MAX_TTL_SECONDS as i64 + 60);

    let session = store
        .create_session(user.id, None, None, Some(u64::MAX))
        .await
        .unwrap();
    assert!(session.expires_at.unwrap() <= limit);
    assert!(store.get_session(session.id, None, None).await.is_ok());

    store
        .cache_set(ResourceType::RATE_LIMIT, "k", "v", Some(u64::MAX))
        .await
        .unwrap();
    store
        .cache_set(ResourceType::RATE_LIMIT, "j", "w", Some(100_000_000_000_000))
        .await
        .unwrap();
    assert_eq!(
        store
            .cache_get(ResourceType::RATE_LIMIT, "k")
            .await
            .unwrap()
            .as_deref(),
        Some("v")
    );

    let token = store
        .create_one_time_token(user.id, TokenType::PasswordReset, u64::MAX)
        .await
        .unwrap();
    store
        .validate_one_time_token(user.id, TokenType::PasswordReset, &token)
        .await
        .unwrap();
}

#[tokio::test]
async fn lucy_signs_in_with_a_cookie_until_the_session_lapses() {
    use crate::auth::cookie;

    const KEY: &[u8] = b"cookie-key";
    let store = connected().await;
    let user = lucy(&store).await;
    let session = store
        .create_session(user.id, None, None, Some(3600))
        .await
        .unwrap();

    let signed = cookie::sign(&session.id.to_string(), KEY);
    let id: Uuid = cookie::verify(&signed, KEY).unwrap().parse().unwrap();
    assert_eq!(id, session.id);
    assert_eq!(store.get_session(id, None, None).await.unwrap(), session);

    if let Some(s) = store.tables.lock().sessions.get_mut(&id) {
        s.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::seconds(1));
    }
    assert!(store
        .get_session(id, None, None)
        .await
        .unwrap_err()
        .is_not_found());

    let tables = store.tables.clone();
    store.disconnect().await.unwrap();
    assert!(!tables.lock().sessions.contains_key(&id));
}
