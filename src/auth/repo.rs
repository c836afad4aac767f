use crate::auth::repo_types::User;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use sqlx::PgPool;

/// Persistence capabilities the auth service needs from a user store.
///
/// `insert` must enforce the email and username uniqueness itself: the
/// service's pre-checks cannot be trusted under concurrent registration.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>>;
    async fn insert(&self, email: &str, username: &str, password_hash: &str) -> AppResult<User>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, password_hash, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, username, password_hash, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn insert(&self, email: &str, username: &str, password_hash: &str) -> AppResult<User> {
        let inserted = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, username, password_hash)
            VALUES ($1, $2, $3)
            RETURNING id, email, username, password_hash, created_at, updated_at
            "#,
        )
        .bind(email)
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(user) => Ok(user),
            // The unique constraints are the source of truth for duplicate
            // registrations; a race lost here surfaces as a conflict.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let message = match db.constraint() {
                    Some("users_username_key") => "Username already taken",
                    _ => "Email already registered",
                };
                Err(AppError::Conflict(message.into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests; enforces the same uniqueness contract as the
/// database constraints.
#[derive(Default)]
pub struct MemoryUserStore {
    users: std::sync::Mutex<Vec<User>>,
}

impl MemoryUserStore {
    /// Test helper: drop a user so a previously issued token goes stale.
    pub fn remove_by_email(&self, email: &str) -> Option<User> {
        let mut users = self.users.lock().unwrap();
        let idx = users.iter().position(|u| u.email == email)?;
        Some(users.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.username == username).cloned())
    }

    async fn insert(&self, email: &str, username: &str, password_hash: &str) -> AppResult<User> {
        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| u.email == email) {
            return Err(AppError::Conflict("Email already registered".into()));
        }
        if users.iter().any(|u| u.username == username) {
            return Err(AppError::Conflict("Username already taken".into()));
        }
        let now = time::OffsetDateTime::now_utc();
        let user = User {
            id: uuid::Uuid::new_v4(),
            email: email.to_owned(),
            username: username.to_owned(),
            password_hash: password_hash.to_owned(),
            created_at: now,
            updated_at: now,
        };
        users.push(user.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicates_without_prechecks() {
        let store = MemoryUserStore::default();
        store.insert("a@x.com", "alice", "hash").await.unwrap();

        let err = store.insert("a@x.com", "bob", "hash").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Email already registered"));

        let err = store.insert("b@x.com", "alice", "hash").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(ref m) if m == "Username already taken"));

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn find_by_email_and_username() {
        let store = MemoryUserStore::default();
        let created = store.insert("a@x.com", "alice", "hash").await.unwrap();

        let by_email = store.find_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, created.id);

        let by_username = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_username.id, created.id);

        assert!(store.find_by_email("missing@x.com").await.unwrap().is_none());
        assert!(store.find_by_username("missing").await.unwrap().is_none());
    }
}
