pub mod models;
pub mod schema;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub fn build_db_pool(db_url: &str, max_size: usize) -> Result<DbPool, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(manager).max_size(max_size.max(1)).build()
}

/// Applies pending schema migrations over a short-lived synchronous connection.
///
/// Returns the number of migrations applied.
pub fn run_migrations(db_url: &str) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let mut conn = PgConnection::establish(db_url)?;
    let applied = conn.run_pending_migrations(MIGRATIONS)?;
    Ok(applied.len())
}
