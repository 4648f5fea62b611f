//! Storage engine wrapper around redb.
//!
//! Provides database lifecycle management and schema initialization. The
//! handle is cheap to clone and shared by the admin store, the log store,
//! and the quota manager.

use std::path::Path;
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::Database;

use canopy_types::config::StorageConfig;
use canopy_types::Result;

use crate::errors::{commit_err, db_err, table_err, txn_err};
use crate::tables::Tables;

/// Shared handle to the backing database.
pub struct StorageEngine {
    db: Arc<Database>,
}

impl StorageEngine {
    /// Opens or creates a database at the given path.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let db = Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .create(path.as_ref())
            .map_err(db_err)?;
        Self::from_database(db)
    }

    /// Creates an in-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(db_err)?;
        Self::from_database(db)
    }

    fn from_database(db: Database) -> Result<Self> {
        let engine = Self { db: Arc::new(db) };
        engine.init_tables()?;
        Ok(engine)
    }

    /// Creates every table so later read transactions never observe a
    /// missing table.
    fn init_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(txn_err)?;
        for def in Tables::ALL {
            txn.open_table(def).map_err(table_err)?;
        }
        txn.commit().map_err(commit_err)
    }

    /// Returns the shared database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self { db: Arc::clone(&self.db) }
    }
}
