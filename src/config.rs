//! Configuration manager for account service.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of current instance, used on verification links.
    pub url: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Account security rules.
    #[serde(default)]
    pub security: Security,
    /// Profile pictures storage.
    #[serde(default)]
    pub storage: Storage,
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// RabbitMQ mailing queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// Account security rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    /// Failed logins before the account gets locked.
    pub max_login_attempts: u32,
    pub min_password_length: usize,
    pub min_nickname_length: usize,
    /// Upper bounds, matching the `users` columns.
    pub max_nickname_length: usize,
    pub max_email_length: usize,
    /// Generated nicknames tried before falling back on a random suffix.
    pub nickname_attempts: u32,
    /// Upper bound for the verification email publication.
    pub mail_timeout_secs: u64,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            max_login_attempts: 3,
            min_password_length: 8,
            min_nickname_length: 3,
            max_nickname_length: 50,
            max_email_length: 255,
            nickname_attempts: 10,
            mail_timeout_secs: 10,
        }
    }
}

/// Object storage configuration for profile pictures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    /// Directory holding buckets.
    pub root: PathBuf,
    /// URL serving `root`.
    pub public_url: String,
    pub bucket: String,
    /// Maximum picture size in bytes.
    pub max_picture_size: usize,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            public_url: "http://localhost:9000".into(),
            bucket: "profile-pictures".into(),
            max_picture_size: 5 * 1024 * 1024, // 5 MiB.
        }
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.as_str().trim_end_matches('/').to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                Ok(Arc::new(self.finalize(config)?))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(
        yaml: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config: Configuration = serde_yaml::from_str(yaml)?;
        Ok(Self::default().finalize(config)?)
    }

    fn finalize(&self, mut config: Self) -> Result<Self, url::ParseError> {
        // set app version.
        config.version = VERSION.to_owned();

        // normalize URLs.
        if !config.url.is_empty() {
            config.url = self.normalize_url(&config.url)?;
        }
        config.storage.public_url =
            self.normalize_url(&config.storage.public_url)?;

        Ok(config)
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.security.max_login_attempts, 3);
        assert_eq!(config.security.min_password_length, 8);
        assert_eq!(config.security.min_nickname_length, 3);
        assert_eq!(config.security.max_nickname_length, 50);
        assert_eq!(config.security.max_email_length, 255);
        assert_eq!(config.storage.bucket, "profile-pictures");
        assert!(config.postgres.is_none());
    }

    #[test]
    fn test_from_yaml() {
        let config = Configuration::from_yaml(
            r#"
name: accounts
url: accounts.example.com/
postgres:
  address: localhost:5432
security:
  max_login_attempts: 5
storage:
  public_url: http://cdn.example.com
"#,
        )
        .unwrap();

        assert_eq!(config.url, "https://accounts.example.com");
        assert_eq!(config.security.max_login_attempts, 5);
        // untouched fields keep their defaults.
        assert_eq!(config.security.nickname_attempts, 10);
        assert_eq!(config.storage.public_url, "http://cdn.example.com");
        assert_eq!(config.storage.bucket, "profile-pictures");
        assert_eq!(
            config.postgres.map(|p| p.address),
            Some("localhost:5432".into())
        );
    }

    #[test]
    fn test_missing_file_fallback() {
        let config = Configuration::default()
            .path(PathBuf::from("does/not/exist.yaml"))
            .read()
            .unwrap();
        assert_eq!(config.security, Security::default());
    }
}
