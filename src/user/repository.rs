//! Handle database requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::user::{User, UserChanges};

/// Key of the advisory lock serializing account insertions.
const ADMISSION_LOCK: i64 = 0x5553_4552; // "USER"

const COLUMNS: &str = r#"id, email, nickname, first_name, last_name, bio,
    profile_picture_url, github_profile_url, linkedin_profile_url,
    hashed_password, role, email_verified, verification_token, is_locked,
    failed_login_attempts, last_login_at, created_at, updated_at"#;

/// Unique key to look a [`User`] up.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Id(Uuid),
    Email(&'a str),
    Nickname(&'a str),
}

/// Settles the final shape of a new [`User`] from the number of accounts
/// already stored. Runs inside the insertion critical section.
pub type Admission = Box<dyn FnOnce(u64, User) -> User + Send>;

/// Port for user persistence.
///
/// `Ok(None)` means the record does not exist, `Err` means storage failed.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Find a user by one of its unique keys.
    async fn find(&self, lookup: Lookup<'_>) -> Result<Option<User>>;

    /// Insert a user once `admit` has settled it, serialized against every
    /// other insertion.
    async fn create(&self, user: User, admit: Admission) -> Result<User>;

    /// Apply `changes` on a user atomically.
    async fn update(
        &self,
        id: Uuid,
        changes: &UserChanges,
    ) -> Result<Option<User>>;

    /// Hard delete a user. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Total number of users.
    async fn count(&self) -> Result<u64>;

    /// Page of users in creation order.
    async fn list(&self, skip: u64, limit: u64) -> Result<Vec<User>>;

    /// Increment failed attempts of an unlocked user and lock it once
    /// `max_attempts` is reached, in a single step. `None` if the user is
    /// missing or already locked.
    async fn record_login_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
    ) -> Result<Option<User>>;

    /// Reset failed attempts and stamp the login of a verified, unlocked
    /// user. `None` if the user no longer qualifies.
    async fn record_login_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<User>>;

    /// Verify the email of a user still holding exactly `token`, clearing
    /// the token and promoting an anonymous user to authenticated, in a
    /// single step. `None` if the user is missing or the token differs.
    async fn consume_verification_token(
        &self,
        id: Uuid,
        token: &str,
    ) -> Result<Option<User>>;

    /// Unlock a locked user and reset its failed attempts in a single step.
    /// `None` if the user is missing or not locked.
    async fn unlock(&self, id: Uuid) -> Result<Option<User>>;
}

/// PostgreSQL user repository.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: Pool<Postgres>,
}

impl PgUserRepository {
    /// Create a new [`PgUserRepository`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Turn unique violations into their validation error.
fn conflict(err: sqlx::Error) -> Error {
    let duplicate = err
        .as_database_error()
        .filter(|e| e.is_unique_violation())
        .and_then(|e| match e.constraint() {
            Some("users_email_key") => Some(Error::DuplicateEmail),
            Some("users_nickname_key") => Some(Error::DuplicateNickname),
            _ => None,
        });

    duplicate.unwrap_or(Error::Sql(err))
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find(&self, lookup: Lookup<'_>) -> Result<Option<User>> {
        let query = match lookup {
            Lookup::Id(id) => {
                sqlx::query_as::<_, User>(&format!(
                    "SELECT {COLUMNS} FROM users WHERE id = $1"
                ))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
            },
            Lookup::Email(email) => {
                sqlx::query_as::<_, User>(&format!(
                    "SELECT {COLUMNS} FROM users WHERE email = $1"
                ))
                .bind(email)
                .fetch_optional(&self.pool)
                .await
            },
            Lookup::Nickname(nickname) => {
                sqlx::query_as::<_, User>(&format!(
                    "SELECT {COLUMNS} FROM users WHERE nickname = $1"
                ))
                .bind(nickname)
                .fetch_optional(&self.pool)
                .await
            },
        };

        Ok(query?)
    }

    async fn create(&self, user: User, admit: Admission) -> Result<User> {
        let mut tx = self.pool.begin().await?;

        // Released on commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADMISSION_LOCK)
            .execute(&mut *tx)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *tx)
            .await?;
        let user = admit(count.max(0) as u64, user);

        let user = sqlx::query_as::<_, User>(&format!(
            r#"INSERT INTO users ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                RETURNING {COLUMNS}"#
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.nickname)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.bio)
        .bind(&user.profile_picture_url)
        .bind(&user.github_profile_url)
        .bind(&user.linkedin_profile_url)
        .bind(&user.hashed_password)
        .bind(user.role)
        .bind(user.email_verified)
        .bind(&user.verification_token)
        .bind(user.is_locked)
        .bind(user.failed_login_attempts)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(conflict)?;

        tx.commit().await?;

        Ok(user)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &UserChanges,
    ) -> Result<Option<User>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut user) = sqlx::query_as::<_, User>(&format!(
            "SELECT {COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        changes.apply(&mut user);

        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users
                SET email = $2, nickname = $3, first_name = $4, last_name = $5,
                    bio = $6, profile_picture_url = $7, github_profile_url = $8,
                    linkedin_profile_url = $9, hashed_password = $10, role = $11,
                    email_verified = $12, verification_token = $13,
                    is_locked = $14, failed_login_attempts = $15,
                    updated_at = $16
                WHERE id = $1
                RETURNING {COLUMNS}"#
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.nickname)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.bio)
        .bind(&user.profile_picture_url)
        .bind(&user.github_profile_url)
        .bind(&user.linkedin_profile_url)
        .bind(&user.hashed_password)
        .bind(user.role)
        .bind(user.email_verified)
        .bind(&user.verification_token)
        .bind(user.is_locked)
        .bind(user.failed_login_attempts)
        .bind(user.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(conflict)?;

        tx.commit().await?;

        Ok(Some(user))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn list(&self, skip: u64, limit: u64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {COLUMNS} FROM users ORDER BY created_at, id OFFSET $1 LIMIT $2"
        ))
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn record_login_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
    ) -> Result<Option<User>> {
        // Right-hand side reads the row as it was before the update.
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users
                SET failed_login_attempts = failed_login_attempts + 1,
                    is_locked = failed_login_attempts + 1 >= $2,
                    updated_at = NOW()
                WHERE id = $1 AND is_locked = FALSE
                RETURNING {COLUMNS}"#
        ))
        .bind(id)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn record_login_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users
                SET failed_login_attempts = 0, last_login_at = $2, updated_at = $2
                WHERE id = $1 AND is_locked = FALSE AND email_verified = TRUE
                RETURNING {COLUMNS}"#
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn consume_verification_token(
        &self,
        id: Uuid,
        token: &str,
    ) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users
                SET email_verified = TRUE, verification_token = NULL,
                    role = CASE WHEN role = 'ANONYMOUS'
                        THEN 'AUTHENTICATED'::user_role ELSE role END,
                    updated_at = NOW()
                WHERE id = $1 AND verification_token = $2
                RETURNING {COLUMNS}"#
        ))
        .bind(id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn unlock(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users
                SET is_locked = FALSE, failed_login_attempts = 0, updated_at = NOW()
                WHERE id = $1 AND is_locked = TRUE
                RETURNING {COLUMNS}"#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserRole;

    fn admit_as_is() -> Admission {
        Box::new(|_, user| user)
    }

    fn user(email: &str, nickname: &str) -> User {
        User::new(email.into(), nickname.into(), "$argon2id$digest".into())
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_create_and_find(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);

        let created = repo
            .create(
                user("a@x.com", "abc"),
                Box::new(|count, mut user| {
                    assert_eq!(count, 0);
                    user.role = UserRole::Admin;
                    user
                }),
            )
            .await
            .unwrap();
        assert_eq!(created.role, UserRole::Admin);

        let by_id = repo.find(Lookup::Id(created.id)).await.unwrap();
        let by_email = repo.find(Lookup::Email("a@x.com")).await.unwrap();
        let by_nickname = repo.find(Lookup::Nickname("abc")).await.unwrap();
        assert_eq!(by_id.as_ref().map(|u| u.id), Some(created.id));
        assert_eq!(by_email.map(|u| u.id), Some(created.id));
        assert_eq!(by_nickname.map(|u| u.id), Some(created.id));

        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_unique_constraints(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        repo.create(user("a@x.com", "abc"), admit_as_is())
            .await
            .unwrap();

        let err = repo
            .create(user("a@x.com", "other"), admit_as_is())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEmail));

        let err = repo
            .create(user("b@x.com", "abc"), admit_as_is())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateNickname));
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_login_counter(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        let mut verified = user("a@x.com", "abc");
        verified.email_verified = true;
        let created = repo.create(verified, admit_as_is()).await.unwrap();

        let first = repo.record_login_failure(created.id, 2).await.unwrap();
        assert_eq!(first.map(|u| (u.failed_login_attempts, u.is_locked)), Some((1, false)));

        let second = repo.record_login_failure(created.id, 2).await.unwrap();
        assert_eq!(second.map(|u| (u.failed_login_attempts, u.is_locked)), Some((2, true)));

        // locked accounts neither count nor log in.
        assert!(repo.record_login_failure(created.id, 2).await.unwrap().is_none());
        assert!(
            repo.record_login_success(created.id, Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_update_and_delete(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        let created = repo
            .create(user("a@x.com", "abc"), admit_as_is())
            .await
            .unwrap();

        let changes = UserChanges {
            bio: Some("hello".into()),
            ..Default::default()
        };
        let updated = repo.update(created.id, &changes).await.unwrap();
        assert_eq!(updated.and_then(|u| u.bio), Some("hello".into()));
        assert!(repo.update(Uuid::new_v4(), &changes).await.unwrap().is_none());

        assert!(repo.delete(created.id).await.unwrap());
        assert!(!repo.delete(created.id).await.unwrap());
        assert!(repo.list(0, 10).await.unwrap().is_empty());
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_consume_verification_token(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        let mut pending = user("a@x.com", "abc");
        pending.verification_token = Some("cafe".into());
        let created = repo.create(pending, admit_as_is()).await.unwrap();

        assert!(
            repo.consume_verification_token(created.id, "wrong")
                .await
                .unwrap()
                .is_none()
        );

        let verified = repo
            .consume_verification_token(created.id, "cafe")
            .await
            .unwrap()
            .unwrap();
        assert!(verified.email_verified);
        assert!(verified.verification_token.is_none());
        assert_eq!(verified.role, UserRole::Authenticated);

        // one shot.
        assert!(
            repo.consume_verification_token(created.id, "cafe")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_unlock(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        let created = repo
            .create(user("a@x.com", "abc"), admit_as_is())
            .await
            .unwrap();

        assert!(repo.unlock(created.id).await.unwrap().is_none());
        repo.record_login_failure(created.id, 1).await.unwrap();

        let unlocked = repo.unlock(created.id).await.unwrap().unwrap();
        assert!(!unlocked.is_locked);
        assert_eq!(unlocked.failed_login_attempts, 0);
        assert!(repo.unlock(created.id).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL instance"]
    async fn test_long_profile_fields(pool: Pool<Postgres>) {
        let repo = PgUserRepository::new(pool);
        let mut long = user("a@x.com", "abc");
        long.bio = Some("b".repeat(5000));
        long.first_name = Some("f".repeat(300));
        long.profile_picture_url = Some(format!("https://cdn.test/{}", "p".repeat(400)));

        let created = repo.create(long, admit_as_is()).await.unwrap();
        assert_eq!(created.first_name.map(|f| f.len()), Some(300));
    }
}
