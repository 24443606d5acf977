use anyhow::Result;
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use diesel_migrations::EmbeddedMigrations;

use crate::core::aliases::DbPool;

pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(manager).await?;
    Ok(pool)
}

/// Runs pending migrations on a blocking thread; diesel's migration harness
/// is synchronous.
pub async fn run_migrations_blocking(
    migrations: EmbeddedMigrations,
    database_url: &str,
) -> Result<usize> {
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        use diesel::Connection;
        use diesel_migrations::MigrationHarness;

        let mut conn = diesel::pg::PgConnection::establish(&url)?;
        let versions = conn
            .run_pending_migrations(migrations)
            .map_err(|err| anyhow::anyhow!("failed to run migrations: {err}"))?;
        Ok::<usize, anyhow::Error>(versions.len())
    })
    .await?
}
