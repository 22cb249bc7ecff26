//! SQLite database for the Scriptgate server.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use tracing::info;

pub use scriptgate_core::db::DatabaseError;
use scriptgate_core::db::{Location, connect};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Handle to the server's tables. Cheap to clone.
#[derive(Clone)]
pub struct ServerDatabase {
    pool: SqlitePool,
}

impl ServerDatabase {
    /// Open or create the database file and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::File(path)).await?).await
    }

    /// A fresh in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::Memory).await?).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DatabaseError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!(migrations = MIGRATOR.iter().count(), "Server schema up to date");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
