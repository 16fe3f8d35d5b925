//! In-memory user storage for tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::user::{
    Admission, Lookup, User, UserChanges, UserRepository, UserRole,
};

/// Vector-backed repository keeping creation order.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: Mutex<Vec<User>>,
    broken: AtomicBool,
    yielding: AtomicBool,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail like an unreachable database.
    pub fn break_down(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Hand control back to the scheduler after every lookup, so
    /// concurrent callers interleave between a read and their next write.
    pub fn yield_after_reads(&self) {
        self.yielding.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(Error::Sql(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

fn ensure_unique(users: &[User], candidate: &User) -> Result<()> {
    let others = users.iter().filter(|u| u.id != candidate.id);
    for other in others {
        if other.email == candidate.email {
            return Err(Error::DuplicateEmail);
        }
        if other.nickname == candidate.nickname {
            return Err(Error::DuplicateNickname);
        }
    }
    Ok(())
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find(&self, lookup: Lookup<'_>) -> Result<Option<User>> {
        self.check()?;
        let found = {
            let users = self.users.lock().await;
            users
                .iter()
                .find(|u| match lookup {
                    Lookup::Id(id) => u.id == id,
                    Lookup::Email(email) => u.email == email,
                    Lookup::Nickname(nickname) => u.nickname == nickname,
                })
                .cloned()
        };

        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(found)
    }

    async fn create(&self, user: User, admit: Admission) -> Result<User> {
        self.check()?;
        // Held across count and push.
        let mut users = self.users.lock().await;
        let user = admit(users.len() as u64, user);
        ensure_unique(&users, &user)?;
        users.push(user.clone());
        Ok(user)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &UserChanges,
    ) -> Result<Option<User>> {
        self.check()?;
        let mut users = self.users.lock().await;
        let Some(index) = users.iter().position(|u| u.id == id) else {
            return Ok(None);
        };

        let mut user = users[index].clone();
        changes.apply(&mut user);
        ensure_unique(&users, &user)?;
        users[index] = user.clone();
        Ok(Some(user))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.check()?;
        let mut users = self.users.lock().await;
        let before = users.len();
        users.retain(|u| u.id != id);
        Ok(users.len() != before)
    }

    async fn count(&self) -> Result<u64> {
        self.check()?;
        Ok(self.users.lock().await.len() as u64)
    }

    async fn list(&self, skip: u64, limit: u64) -> Result<Vec<User>> {
        self.check()?;
        let users = self.users.lock().await;
        Ok(users
            .iter()
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn record_login_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
    ) -> Result<Option<User>> {
        self.check()?;
        let mut users = self.users.lock().await;
        let Some(user) = users.iter_mut().find(|u| u.id == id && !u.is_locked)
        else {
            return Ok(None);
        };

        user.failed_login_attempts += 1;
        user.is_locked = user.failed_login_attempts as i64 >= max_attempts as i64;
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn record_login_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<User>> {
        self.check()?;
        let mut users = self.users.lock().await;
        let Some(user) = users
            .iter_mut()
            .find(|u| u.id == id && !u.is_locked && u.email_verified)
        else {
            return Ok(None);
        };

        user.failed_login_attempts = 0;
        user.last_login_at = Some(at);
        user.updated_at = at;
        Ok(Some(user.clone()))
    }

    async fn consume_verification_token(
        &self,
        id: Uuid,
        token: &str,
    ) -> Result<Option<User>> {
        self.check()?;
        let mut users = self.users.lock().await;
        let Some(user) = users
            .iter_mut()
            .find(|u| u.id == id && u.verification_token.as_deref() == Some(token))
        else {
            return Ok(None);
        };

        user.email_verified = true;
        user.verification_token = None;
        if user.role == UserRole::Anonymous {
            user.role = UserRole::Authenticated;
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn unlock(&self, id: Uuid) -> Result<Option<User>> {
        self.check()?;
        let mut users = self.users.lock().await;
        let Some(user) = users.iter_mut().find(|u| u.id == id && u.is_locked)
        else {
            return Ok(None);
        };

        user.is_locked = false;
        user.failed_login_attempts = 0;
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }
}
