use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use super::jwt::JwtKeys;
use super::password::{hash_password, verify_password};
use super::repo::UserStore;
use super::repo_types::User;
use crate::error::{AppError, AppResult};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Input checks that run before any store interaction.
fn validate_registration(email: &str, username: &str, password: &str) -> AppResult<()> {
    if !is_valid_email(email) {
        return Err(AppError::Validation("Invalid email".into()));
    }
    if username.len() < 3 || username.len() > 50 {
        return Err(AppError::Validation(
            "Username must be between 3 and 50 characters".into(),
        ));
    }
    if password.len() < 8 {
        return Err(AppError::Validation("Password too short".into()));
    }
    Ok(())
}

/// Register a new user: validate, check email then username, hash, persist.
///
/// The pre-checks only make the error message deterministic; the store's
/// unique constraints decide concurrent duplicate registrations.
pub async fn register(
    users: &dyn UserStore,
    email: &str,
    username: &str,
    password: &str,
) -> AppResult<User> {
    validate_registration(email, username, password)?;

    if users.find_by_email(email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::Conflict("Email already registered".into()));
    }
    if users.find_by_username(username).await?.is_some() {
        warn!(username = %username, "username already taken");
        return Err(AppError::Conflict("Username already taken".into()));
    }

    let hash = hash_password(password)?;
    let user = users.insert(email, username, &hash).await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(user)
}

/// Look up by email and verify the password. Unknown email and wrong
/// password both come back as `None` so callers cannot enumerate accounts.
pub async fn authenticate(
    users: &dyn UserStore,
    email: &str,
    password: &str,
) -> AppResult<Option<User>> {
    let user = match users.find_by_email(email).await? {
        Some(u) => u,
        None => {
            warn!(email = %email, "login unknown email");
            return Ok(None);
        }
    };

    if !verify_password(password, &user.password_hash) {
        warn!(user_id = %user.id, "login invalid password");
        return Ok(None);
    }

    Ok(Some(user))
}

/// Resolve the user a bearer token identifies. Read-only apart from the
/// store lookup, so it is safe to run on every protected request.
pub async fn resolve_current_user(
    users: &dyn UserStore,
    keys: &JwtKeys,
    token: &str,
) -> AppResult<User> {
    let claims = keys
        .verify(token)
        .map_err(|_| AppError::Unauthorized("Could not validate credentials".into()))?;

    if claims.sub.is_empty() {
        return Err(AppError::Unauthorized(
            "Could not validate credentials".into(),
        ));
    }

    match users.find_by_email(&claims.sub).await? {
        Some(user) => Ok(user),
        None => {
            warn!(subject = %claims.sub, "token subject no longer exists");
            Err(AppError::NotFound("User not found".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::MemoryUserStore;
    use crate::state::AppState;
    use axum::extract::FromRef;

    fn make_keys() -> JwtKeys {
        let state = AppState::fake();
        JwtKeys::from_ref(&state)
    }

    #[tokio::test]
    async fn register_then_authenticate_roundtrip() {
        let store = MemoryUserStore::default();
        let user = register(&store, "a@x.com", "alice", "password123")
            .await
            .expect("register");
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.username, "alice");
        assert_ne!(user.password_hash, "password123");
        assert!(!user.password_hash.is_empty());

        let authed = authenticate(&store, "a@x.com", "password123")
            .await
            .expect("authenticate")
            .expect("credentials should match");
        assert_eq!(authed.id, user.id);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_are_indistinguishable() {
        let store = MemoryUserStore::default();
        register(&store, "a@x.com", "alice", "password123")
            .await
            .unwrap();

        let wrong_password = authenticate(&store, "a@x.com", "wrongpass").await.unwrap();
        let unknown_email = authenticate(&store, "nobody@x.com", "password123")
            .await
            .unwrap();
        assert!(wrong_password.is_none());
        assert!(unknown_email.is_none());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_before_username() {
        let store = MemoryUserStore::default();
        register(&store, "a@x.com", "alice", "password123")
            .await
            .unwrap();

        // Same email and same username: the email check runs first.
        let err = register(&store, "a@x.com", "alice", "other1234")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Email already registered"));

        let err = register(&store, "a@x.com", "bob", "other1234")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Email already registered"));

        let err = register(&store, "b@x.com", "alice", "other1234")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Username already taken"));
    }

    #[tokio::test]
    async fn validation_runs_before_any_store_interaction() {
        let store = MemoryUserStore::default();

        let err = register(&store, "not-an-email", "alice", "password123")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = register(&store, "a@x.com", "al", "password123")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = register(&store, "a@x.com", &"a".repeat(51), "password123")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = register(&store, "a@x.com", "alice", "short").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concrete_scenario_alice_and_bob() {
        let store = MemoryUserStore::default();

        let alice = register(&store, "a@x.com", "alice", "password123")
            .await
            .expect("alice registers");

        let err = register(&store, "a@x.com", "bob", "other1234")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Email already registered"));

        let authed = authenticate(&store, "a@x.com", "password123")
            .await
            .unwrap()
            .expect("alice logs in");
        assert_eq!(authed.id, alice.id);

        assert!(authenticate(&store, "a@x.com", "wrongpass")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resolve_current_user_happy_path() {
        let store = MemoryUserStore::default();
        let keys = make_keys();
        let user = register(&store, "a@x.com", "alice", "password123")
            .await
            .unwrap();
        let token = keys.sign(&user.email).unwrap();

        let resolved = resolve_current_user(&store, &keys, &token)
            .await
            .expect("resolve");
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn resolve_current_user_stale_token_is_not_found() {
        let store = MemoryUserStore::default();
        let keys = make_keys();
        let user = register(&store, "a@x.com", "alice", "password123")
            .await
            .unwrap();
        let token = keys.sign(&user.email).unwrap();

        store.remove_by_email("a@x.com").expect("user existed");

        let err = resolve_current_user(&store, &keys, &token).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_current_user_rejects_invalid_token() {
        let store = MemoryUserStore::default();
        let keys = make_keys();

        let err = resolve_current_user(&store, &keys, "garbage").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn resolve_current_user_rejects_empty_subject() {
        let store = MemoryUserStore::default();
        let keys = make_keys();
        let token = keys.sign("").unwrap();

        let err = resolve_current_user(&store, &keys, &token).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn email_regex_matches_reasonable_addresses() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("invalid"));
        assert!(!is_valid_email("@nodomain.com"));
        assert!(!is_valid_email("spaces in@example.com"));
    }
}
