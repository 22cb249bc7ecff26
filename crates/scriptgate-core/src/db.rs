//! `SQLite` plumbing shared by the storage layer: connection setup, the
//! storage error type and the clock used for every stored timestamp.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

/// Connections kept open against a database file.
const FILE_POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Where a database lives.
#[derive(Debug, Clone, Copy)]
pub enum Location<'a> {
    /// A file, created along with its parent directory when missing.
    File(&'a Path),
    /// A private in-memory database, gone when the pool is dropped.
    Memory,
}

/// Connect a pool with foreign keys enforced.
///
/// An in-memory database exists only as long as its single connection, so
/// that connection is never recycled.
pub async fn connect(location: Location<'_>) -> Result<SqlitePool, DatabaseError> {
    let (url, pool) = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
            }
            (
                format!("sqlite:{}?mode=rwc", path.display()),
                SqlitePoolOptions::new().max_connections(FILE_POOL_SIZE),
            )
        }
        Location::Memory => (
            "sqlite::memory:".to_string(),
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
        ),
    };

    let options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = pool
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    debug!(location = ?location, "Database connected");
    Ok(pool)
}

/// Current time as Unix seconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
