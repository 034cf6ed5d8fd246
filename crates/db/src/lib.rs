//! PostgreSQL access for fleetwatch.
//!
//! Pool construction, health checks, migrations, row models, and the
//! repositories used by the persistence gateway.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

pub mod models;
pub mod repositories;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
///
/// When `database_name` is given it overrides the database named in the URL.
pub async fn create_pool(
    database_url: &str,
    database_name: Option<&str>,
) -> Result<DbPool, sqlx::Error> {
    let mut options = PgConnectOptions::from_str(database_url)?;
    if let Some(name) = database_name {
        options = options.database(name);
    }
    PgPoolOptions::new()
        .max_connections(20)
        .connect_with(options)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply all pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
