mod repository;
mod service;

#[cfg(test)]
pub(crate) mod memory;

pub use repository::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access level of a [`User`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    #[default]
    Anonymous,
    Authenticated,
    Manager,
    Admin,
}

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub nickname: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture_url: Option<String>,
    pub github_profile_url: Option<String>,
    pub linkedin_profile_url: Option<String>,
    #[serde(skip)]
    pub hashed_password: String,
    pub role: UserRole,
    pub email_verified: bool,
    #[serde(skip)]
    pub verification_token: Option<String>,
    pub is_locked: bool,
    pub failed_login_attempts: i32,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Fresh unverified account, role is settled when stored.
    pub(crate) fn new(
        email: String,
        nickname: String,
        hashed_password: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email,
            nickname,
            first_name: None,
            last_name: None,
            bio: None,
            profile_picture_url: None,
            github_profile_url: None,
            linkedin_profile_url: None,
            hashed_password,
            role: UserRole::Anonymous,
            email_verified: false,
            verification_token: None,
            is_locked: false,
            failed_login_attempts: 0,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy optional profile fields from a [`Profile`].
    pub(crate) fn with_profile(mut self, profile: Profile) -> Self {
        self.first_name = profile.first_name;
        self.last_name = profile.last_name;
        self.bio = profile.bio;
        self.github_profile_url = profile.github_profile_url;
        self.linkedin_profile_url = profile.linkedin_profile_url;
        self
    }
}

/// Free-form profile fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub github_profile_url: Option<String>,
    pub linkedin_profile_url: Option<String>,
}

/// Fields received when creating an account.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: Option<String>,
    pub password: Option<String>,
    pub nickname: Option<String>,
    #[serde(flatten)]
    pub profile: Profile,
}

/// Fields received when updating an account. Absent fields are untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub nickname: Option<String>,
    pub password: Option<String>,
    pub role: Option<UserRole>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture_url: Option<String>,
    pub github_profile_url: Option<String>,
    pub linkedin_profile_url: Option<String>,
}

/// Resolved change set handed to the [`UserRepository`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChanges {
    pub email: Option<String>,
    pub nickname: Option<String>,
    pub hashed_password: Option<String>,
    pub role: Option<UserRole>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub profile_picture_url: Option<String>,
    pub github_profile_url: Option<String>,
    pub linkedin_profile_url: Option<String>,
    pub email_verified: Option<bool>,
    /// `Some(None)` clears the token.
    pub verification_token: Option<Option<String>>,
    pub is_locked: Option<bool>,
    pub failed_login_attempts: Option<i32>,
}

impl UserChanges {
    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Write every present field into `user` and bump `updated_at`.
    pub fn apply(&self, user: &mut User) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        fn set_some<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set(&mut user.email, &self.email);
        set(&mut user.nickname, &self.nickname);
        set(&mut user.hashed_password, &self.hashed_password);
        set(&mut user.role, &self.role);
        set_some(&mut user.first_name, &self.first_name);
        set_some(&mut user.last_name, &self.last_name);
        set_some(&mut user.bio, &self.bio);
        set_some(&mut user.profile_picture_url, &self.profile_picture_url);
        set_some(&mut user.github_profile_url, &self.github_profile_url);
        set_some(&mut user.linkedin_profile_url, &self.linkedin_profile_url);
        set(&mut user.email_verified, &self.email_verified);
        set(&mut user.verification_token, &self.verification_token);
        set(&mut user.is_locked, &self.is_locked);
        set(&mut user.failed_login_attempts, &self.failed_login_attempts);
        user.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new("a@x.com".into(), "abc".into(), "digest".into())
    }

    #[test]
    fn test_new_user_defaults() {
        let user = user();
        assert_eq!(user.role, UserRole::Anonymous);
        assert!(!user.email_verified);
        assert!(!user.is_locked);
        assert_eq!(user.failed_login_attempts, 0);
        assert!(user.verification_token.is_none());
        assert!(user.last_login_at.is_none());
    }

    #[test]
    fn test_apply_changes() {
        let mut user = user();
        user.verification_token = Some("token".into());
        user.bio = Some("hello".into());

        UserChanges {
            nickname: Some("abcd".into()),
            role: Some(UserRole::Authenticated),
            verification_token: Some(None),
            email_verified: Some(true),
            ..Default::default()
        }
        .apply(&mut user);

        assert_eq!(user.nickname, "abcd");
        assert_eq!(user.role, UserRole::Authenticated);
        assert!(user.email_verified);
        assert!(user.verification_token.is_none());
        // untouched.
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.bio.as_deref(), Some("hello"));
    }

    #[test]
    fn test_empty_changes() {
        assert!(UserChanges::default().is_empty());
        assert!(
            !UserChanges {
                is_locked: Some(false),
                ..Default::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn test_serialization_hides_secrets() {
        let mut user = user();
        user.verification_token = Some("token".into());

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("hashed_password").is_none());
        assert!(json.get("verification_token").is_none());
        assert_eq!(json["role"], "ANONYMOUS");
    }
}
