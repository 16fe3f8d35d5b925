//! PostgreSQL pool and schema.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Postgres;
use crate::error::Result;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "accounts";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connection URL built from configuration, credentials default to
/// `postgres`.
fn connection_url(config: &Postgres) -> String {
    format!(
        "postgres://{}:{}@{}/{}",
        config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
        config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
        config.address,
        config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
    )
}

/// Init database connections.
pub async fn connect(config: &Postgres) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
        .connect(&connection_url(config))
        .await?;

    tracing::info!(
        hostname = %config.address,
        db = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
        "postgres connected"
    );

    Ok(pool)
}

/// Execute pending migration scripts.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!().run(pool).await?;
    tracing::debug!("migrations applied");
    Ok(())
}
