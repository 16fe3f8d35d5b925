//! Error handler for account service.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing every failure the service can meet.
///
/// Validation variants are meant to reach the caller untouched. Every other
/// variant belongs to the infrastructure and is logged by the service before
/// being turned into an absent result.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least {min_length} characters long")]
    WeakPassword { min_length: usize },
    #[error("nickname must be between {min_length} and {max_length} characters long")]
    InvalidNickname { min_length: usize, max_length: usize },
    #[error("user with the given email already exists")]
    DuplicateEmail,
    #[error("user with the given nickname already exists")]
    DuplicateNickname,
    #[error("unsupported picture format")]
    InvalidPicture,
    #[error("picture is {size} bytes while {max} is allowed")]
    PictureTooLarge { size: usize, max: usize },

    #[error("SQL request failed: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("message broker error: {0}")]
    Mail(#[from] lapin::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid scheme for message broker")]
    InvalidScheme,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

impl Error {
    /// Whether error must be forwarded to the caller instead of being
    /// swallowed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidEmail
                | Error::WeakPassword { .. }
                | Error::InvalidNickname { .. }
                | Error::DuplicateEmail
                | Error::DuplicateNickname
                | Error::InvalidPicture
                | Error::PictureTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_family() {
        assert!(Error::InvalidEmail.is_validation());
        assert!(Error::WeakPassword { min_length: 8 }.is_validation());
        assert!(Error::DuplicateNickname.is_validation());
        assert!(!Error::InvalidScheme.is_validation());
        assert!(
            !Error::Timeout {
                operation: "send_verification_email"
            }
            .is_validation()
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Error::WeakPassword { min_length: 8 }.to_string(),
            "password must be at least 8 characters long"
        );
        assert_eq!(Error::InvalidEmail.to_string(), "invalid email address");
    }
}
