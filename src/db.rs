use crate::config;
use crate::error::{Error, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PoolError, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

pub type Connection = PooledConnection<ConnectionManager<SqliteConnection>>;
pub type ConnectionPool = Pool<ConnectionManager<SqliteConnection>>;
pub type ConnectionResult = std::result::Result<Connection, PoolError>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Applies the connection pragmas every pooled connection runs with: WAL
/// journaling so readers don't block the append-only writers, relaxed fsync,
/// enforced foreign keys and a busy timeout for concurrent changesets.
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Builds a connection pool for the database at `database_url`.
pub fn create_pool(database_url: &str) -> std::result::Result<ConnectionPool, PoolError> {
    let manager = ConnectionManager::new(database_url);
    Pool::builder()
        .max_size(config::pool_size())
        .max_lifetime(None)
        .idle_timeout(None)
        .test_on_check_out(true)
        .connection_customizer(Box::new(ConnectionPragmas))
        .build(manager)
}

/// Runs embedded migrations on the database. Pending migrations are applied in
/// order; an already up-to-date database is left untouched.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    let pending = conn
        .pending_migrations(MIGRATIONS)
        .map_err(Error::FailedMigration)?;
    if pending.is_empty() {
        return Ok(());
    }
    tracing::info!("Running {} pending migrations...", pending.len());
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(Error::FailedMigration)?;
    Ok(())
}
