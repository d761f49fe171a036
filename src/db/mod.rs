//! Database module for the kittyparty server
//!
//! Owns the Postgres connection pool and the schema migrations that install
//! the `users` change-notification trigger read by the relay.

use std::time::Duration;

use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::Result;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects eagerly; failure here is fatal at startup.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.url)
        .await?;

    info!("Connected to database (max {} connections)", config.max_connections);
    Ok(pool)
}

/// Builds a pool without opening a connection until first use.
pub fn connect_lazy(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy(&config.url)?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct DbPoolStatus {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
}

pub fn pool_status(pool: &PgPool) -> DbPoolStatus {
    let size = pool.size();
    let idle = pool.num_idle() as u32;

    DbPoolStatus {
        total_connections: size,
        active_connections: size.saturating_sub(idle),
        idle_connections: idle,
    }
}
