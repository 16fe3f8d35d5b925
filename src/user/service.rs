use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::Configuration;
use crate::crypto::{self, PasswordHasher, TOKEN_LENGTH};
use crate::error::{Error, Result};
use crate::mail::Notifier;
use crate::nickname::NicknameGenerator;
use crate::storage::{self, ObjectStorage};
use crate::telemetry::{self, LoginOutcome};
use crate::user::{
    Admission, Lookup, NewUser, User, UserChanges, UserRepository, UserRole,
    UserUpdate,
};

/// Random bytes naming a stored picture.
const PICTURE_KEY_LENGTH: usize = 8;
/// Random bytes appended to a nickname once the generator is exhausted.
const NICKNAME_SUFFIX_LENGTH: usize = 3;

/// Account lifecycle manager.
///
/// Validation failures are returned as [`Error`]. Storage failures are
/// logged and surface as an absent result.
#[derive(Clone)]
pub struct UserService {
    config: Arc<Configuration>,
    repo: Arc<dyn UserRepository>,
    hasher: Arc<dyn PasswordHasher>,
    notifier: Arc<dyn Notifier>,
    nicknames: Arc<dyn NicknameGenerator>,
    storage: Arc<dyn ObjectStorage>,
}

/// Forward validation errors, log and swallow the others.
fn soften<T>(result: Result<T>, operation: &'static str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_validation() => {
            tracing::debug!(operation, error = %err, "validation failed");
            Err(err)
        },
        Err(err) => {
            tracing::error!(operation, error = %err, "operation aborted");
            Ok(None)
        },
    }
}

/// Log a storage failure and fall back on `T::default()`.
fn quiet<T: Default>(result: Result<T>, operation: &'static str) -> T {
    result.unwrap_or_else(|err| {
        tracing::error!(operation, error = %err, "operation aborted");
        T::default()
    })
}

/// First account ever is a verified administrator, the others wait for
/// email verification.
fn admission(token: String) -> Admission {
    Box::new(move |count, mut user| {
        if count == 0 {
            user.role = UserRole::Admin;
            user.email_verified = true;
            user.verification_token = None;
        } else {
            user.role = UserRole::Anonymous;
            user.email_verified = false;
            user.verification_token = Some(token);
        }
        user
    })
}

fn validate_email(email: Option<&str>, max_length: usize) -> Result<&str> {
    match email {
        Some(email)
            if email.split('@').count() == 2
                && email.chars().count() <= max_length =>
        {
            Ok(email)
        },
        _ => Err(Error::InvalidEmail),
    }
}

fn validate_password(password: Option<&str>, min_length: usize) -> Result<&str> {
    match password {
        Some(password) if password.chars().count() >= min_length => {
            Ok(password)
        },
        _ => Err(Error::WeakPassword { min_length }),
    }
}

fn validate_nickname(
    nickname: &str,
    min_length: usize,
    max_length: usize,
) -> Result<()> {
    let length = nickname.chars().count();
    if length < min_length || length > max_length {
        return Err(Error::InvalidNickname {
            min_length,
            max_length,
        });
    }
    Ok(())
}

impl UserService {
    /// Create a new [`UserService`].
    pub fn new(
        config: Arc<Configuration>,
        repo: Arc<dyn UserRepository>,
        hasher: Arc<dyn PasswordHasher>,
        notifier: Arc<dyn Notifier>,
        nicknames: Arc<dyn NicknameGenerator>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            config,
            repo,
            hasher,
            notifier,
            nicknames,
            storage,
        }
    }

    async fn fetch(&self, lookup: Lookup<'_>) -> Option<User> {
        quiet(self.repo.find(lookup).await, "fetch_user")
    }

    /// Find a user using `id` field.
    pub async fn get_by_id(&self, id: Uuid) -> Option<User> {
        self.fetch(Lookup::Id(id)).await
    }

    /// Find a user using `email` field.
    pub async fn get_by_email(&self, email: &str) -> Option<User> {
        self.fetch(Lookup::Email(email)).await
    }

    /// Find a user using `nickname` field.
    pub async fn get_by_nickname(&self, nickname: &str) -> Option<User> {
        self.fetch(Lookup::Nickname(nickname)).await
    }

    /// Create an account.
    ///
    /// The first account becomes a verified administrator. Every other one
    /// is anonymous until its email is verified, and receives a
    /// verification email once stored.
    pub async fn create(&self, new: NewUser) -> Result<Option<User>> {
        let user = soften(self.try_create(new).await, "create_user")?;
        if let Some(user) = &user {
            telemetry::record_account_created(&user.id);
            if user.verification_token.is_some() {
                self.notify(user).await;
            }
        }
        Ok(user)
    }

    /// Public registration entry point.
    pub async fn register_user(&self, new: NewUser) -> Result<Option<User>> {
        self.create(new).await
    }

    async fn try_create(&self, new: NewUser) -> Result<User> {
        let security = &self.config.security;

        let email =
            validate_email(new.email.as_deref(), security.max_email_length)?;
        let password =
            validate_password(new.password.as_deref(), security.min_password_length)?;
        if let Some(nickname) = &new.nickname {
            validate_nickname(
                nickname,
                security.min_nickname_length,
                security.max_nickname_length,
            )?;
        }

        if self.repo.find(Lookup::Email(email)).await?.is_some() {
            return Err(Error::DuplicateEmail);
        }

        let hashed_password = self.hasher.hash(password)?;

        let nickname = match &new.nickname {
            Some(nickname) => {
                if self.repo.find(Lookup::Nickname(nickname)).await?.is_some() {
                    return Err(Error::DuplicateNickname);
                }
                nickname.clone()
            },
            None => self.allocate_nickname().await?,
        };

        let mut user = User::new(email.to_string(), nickname, hashed_password)
            .with_profile(new.profile);
        let token = crypto::random_token(TOKEN_LENGTH);

        // a generated nickname may be claimed between lookup and insert.
        let mut retries = if new.nickname.is_some() {
            0
        } else {
            security.nickname_attempts
        };
        loop {
            match self.repo.create(user.clone(), admission(token.clone())).await {
                Err(Error::DuplicateNickname) if retries > 0 => {
                    retries -= 1;
                    tracing::debug!(nickname = %user.nickname, "generated nickname claimed concurrently");
                    user.nickname = self.allocate_nickname().await?;
                },
                result => return result,
            }
        }
    }

    /// Draw generated nicknames until a free one shows up, within
    /// `nickname_attempts`. Then fall back on a random suffix and let the
    /// unique constraint have the last word.
    async fn allocate_nickname(&self) -> Result<String> {
        let security = &self.config.security;

        for _ in 0..security.nickname_attempts {
            let candidate = self.nicknames.generate();
            let length = candidate.chars().count();
            if length < security.min_nickname_length
                || length > security.max_nickname_length
            {
                continue;
            }
            if self.repo.find(Lookup::Nickname(&candidate)).await?.is_none() {
                return Ok(candidate);
            }
        }

        let fallback = format!(
            "{}_{}",
            self.nicknames.generate(),
            crypto::random_token(NICKNAME_SUFFIX_LENGTH)
        );
        tracing::warn!(
            attempts = security.nickname_attempts,
            nickname = %fallback,
            "nickname generator exhausted"
        );

        Ok(fallback)
    }

    async fn notify(&self, user: &User) {
        let timeout = Duration::from_secs(self.config.security.mail_timeout_secs);
        let result = tokio::time::timeout(
            timeout,
            self.notifier.send_verification_email(user),
        )
        .await
        .unwrap_or(Err(Error::Timeout {
            operation: "send_verification_email",
        }));

        match result {
            Ok(()) => tracing::debug!(user_id = %user.id, "verification email sent"),
            Err(err) => tracing::error!(
                user_id = %user.id,
                error = %err,
                "verification email not sent"
            ),
        }
    }

    /// Update an account with the same rules as creation.
    ///
    /// Returns `None` if the user does not exist.
    pub async fn update(
        &self,
        id: Uuid,
        update: UserUpdate,
    ) -> Result<Option<User>> {
        Ok(soften(self.try_update(id, update).await, "update_user")?.flatten())
    }

    async fn try_update(
        &self,
        id: Uuid,
        update: UserUpdate,
    ) -> Result<Option<User>> {
        let security = &self.config.security;

        if update.email.is_some() {
            validate_email(update.email.as_deref(), security.max_email_length)?;
        }
        let hashed_password = match update.password.as_deref() {
            Some(password) => {
                let password = validate_password(
                    Some(password),
                    security.min_password_length,
                )?;
                Some(self.hasher.hash(password)?)
            },
            None => None,
        };
        if let Some(nickname) = &update.nickname {
            validate_nickname(
                nickname,
                security.min_nickname_length,
                security.max_nickname_length,
            )?;
        }

        let changes = UserChanges {
            email: update.email,
            nickname: update.nickname,
            hashed_password,
            role: update.role,
            first_name: update.first_name,
            last_name: update.last_name,
            bio: update.bio,
            profile_picture_url: update.profile_picture_url,
            github_profile_url: update.github_profile_url,
            linkedin_profile_url: update.linkedin_profile_url,
            ..Default::default()
        };

        if changes.is_empty() {
            return self.repo.find(Lookup::Id(id)).await;
        }

        self.repo.update(id, &changes).await
    }

    /// Hard delete an account. Returns whether it existed.
    pub async fn delete(&self, id: Uuid) -> bool {
        let deleted = quiet(self.repo.delete(id).await, "delete_user");
        if deleted {
            tracing::info!(user_id = %id, "account deleted");
        }
        deleted
    }

    /// Page of accounts in creation order.
    pub async fn list_users(&self, skip: u64, limit: u64) -> Vec<User> {
        quiet(self.repo.list(skip, limit).await, "list_users")
    }

    /// Total number of accounts, `None` if storage is unreachable.
    pub async fn count(&self) -> Option<u64> {
        soften(self.repo.count().await, "count_users")
            .ok()
            .flatten()
    }

    /// Authenticate with email and password.
    ///
    /// Unknown email, unverified or locked account and wrong password all
    /// end on the same `None`. Each wrong password counts towards the
    /// lockout.
    pub async fn login_user(&self, email: &str, password: &str) -> Option<User> {
        let user = match self.repo.find(Lookup::Email(email)).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                telemetry::record_login(LoginOutcome::UnknownEmail);
                return None;
            },
            Err(err) => {
                tracing::error!(operation = "login_user", error = %err, "operation aborted");
                return None;
            },
        };

        if !user.email_verified {
            telemetry::record_login(LoginOutcome::Unverified);
            return None;
        }
        if user.is_locked {
            telemetry::record_login(LoginOutcome::Locked);
            return None;
        }

        if self.hasher.verify(password, &user.hashed_password) {
            return match self.repo.record_login_success(user.id, Utc::now()).await {
                Ok(Some(user)) => {
                    telemetry::record_login(LoginOutcome::Success);
                    Some(user)
                },
                // locked in the meantime.
                Ok(None) => {
                    telemetry::record_login(LoginOutcome::Locked);
                    None
                },
                Err(err) => {
                    tracing::error!(operation = "login_user", error = %err, "operation aborted");
                    None
                },
            };
        }

        let max_attempts = self.config.security.max_login_attempts;
        match self.repo.record_login_failure(user.id, max_attempts).await {
            Ok(Some(user)) if user.is_locked => {
                telemetry::record_lockout(&user.id, user.failed_login_attempts)
            },
            Ok(_) => (),
            Err(err) => {
                tracing::error!(operation = "login_user", error = %err, "operation aborted")
            },
        }
        telemetry::record_login(LoginOutcome::WrongPassword);

        None
    }

    /// Replace the password, reset failed attempts and unlock the account.
    ///
    /// Returns `false` if the user does not exist.
    pub async fn reset_password(&self, id: Uuid, new_password: &str) -> Result<bool> {
        let password = validate_password(
            Some(new_password),
            self.config.security.min_password_length,
        )?;

        let result: Result<Option<User>> = async {
            let changes = UserChanges {
                hashed_password: Some(self.hasher.hash(password)?),
                failed_login_attempts: Some(0),
                is_locked: Some(false),
                ..Default::default()
            };
            self.repo.update(id, &changes).await
        }
        .await;

        Ok(soften(result, "reset_password")?.flatten().is_some())
    }

    /// Consume the verification token of a user.
    ///
    /// Only an exact token match verifies the email and promotes an
    /// anonymous user to authenticated. Anything else changes nothing.
    pub async fn verify_email_with_token(&self, id: Uuid, token: &str) -> bool {
        let verified = quiet(
            self.repo.consume_verification_token(id, token).await,
            "verify_email",
        )
        .is_some();
        if verified {
            tracing::info!(user_id = %id, "email verified");
        }
        verified
    }

    /// Unlock a locked account. Returns `false` if the user does not exist
    /// or is not locked.
    pub async fn unlock_user_account(&self, id: Uuid) -> bool {
        let unlocked =
            quiet(self.repo.unlock(id).await, "unlock_user_account").is_some();
        if unlocked {
            tracing::info!(user_id = %id, "account unlocked");
        }
        unlocked
    }

    /// Whether the account behind `email` exists and is locked.
    pub async fn is_account_locked(&self, email: &str) -> bool {
        self.get_by_email(email)
            .await
            .is_some_and(|user| user.is_locked)
    }

    /// Store a new profile picture and link it to the user.
    ///
    /// Returns `None` if the user does not exist.
    pub async fn upload_profile_picture(
        &self,
        id: Uuid,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<Option<User>> {
        let extension = storage::picture_extension(
            filename,
            content_type,
            data.len(),
            self.config.storage.max_picture_size,
        )?;

        let result = self
            .try_upload_profile_picture(id, extension, content_type, data)
            .await;

        Ok(soften(result, "upload_profile_picture")?.flatten())
    }

    async fn try_upload_profile_picture(
        &self,
        id: Uuid,
        extension: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<Option<User>> {
        if self.repo.find(Lookup::Id(id)).await?.is_none() {
            return Ok(None);
        }

        let bucket = &self.config.storage.bucket;
        if !self.storage.bucket_exists(bucket).await? {
            self.storage.make_bucket(bucket).await?;
        }

        let key = format!(
            "{id}/{}.{extension}",
            crypto::random_token(PICTURE_KEY_LENGTH)
        );
        self.storage
            .put_object(bucket, &key, content_type, data)
            .await?;

        let changes = UserChanges {
            profile_picture_url: Some(self.storage.object_url(bucket, &key)),
            ..Default::default()
        };
        let updated = self.repo.update(id, &changes).await;

        // user vanished or storage failed: nothing links to the object.
        if !matches!(updated, Ok(Some(_))) {
            if let Err(err) = self.storage.remove_object(bucket, &key).await {
                tracing::warn!(bucket, key, error = %err, "orphan picture left behind");
            }
        }

        updated
    }
}
