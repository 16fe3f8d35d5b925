//! Account service: registration, email verification, login lockout and
//! profile management on top of PostgreSQL.

#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod mail;
pub mod nickname;
pub mod storage;
pub mod telemetry;
pub mod user;

use std::sync::Arc;

use sqlx::PgPool;

/// Everything a caller needs to drive accounts.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: PgPool,
    pub users: user::UserService,
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let Some(postgres) = &config.postgres else {
        tracing::error!("missing `postgres` entry on `config.yaml` file");
        return Err("missing `postgres` configuration".into());
    };
    let db = database::connect(postgres).await?;

    let hasher = crypto::PasswordManager::new(config.argon2.clone())?;

    // handle mail sender.
    let mail = if let Some(cfg) = &config.mail {
        mail::MailManager::new(cfg, &config.url).await?
    } else {
        tracing::warn!("no `mail` entry, verification emails are not sent");
        mail::MailManager::disconnected(&config.url)
    };

    let storage = storage::FsObjectStorage::new(&config.storage);

    let users = user::UserService::new(
        Arc::clone(&config),
        Arc::new(user::PgUserRepository::new(db.clone())),
        Arc::new(hasher),
        Arc::new(mail),
        Arc::new(nickname::RandomNickname),
        Arc::new(storage),
    );

    Ok(AppState { config, db, users })
}
