use once_cell::sync::OnceCell;
use redb::Database;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Process wide registry of open redb files.
///
/// redb refuses to open the same file twice in one process, so the index and the
/// transaction log go through here and share one handle when they point at the same path.
static GLOBAL_DB_MANAGER: OnceCell<DatabaseManager> = OnceCell::new();

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to open database {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Database registry lock poisoned")]
    Poisoned,

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

pub struct DatabaseManager {
    databases: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl DatabaseManager {
    fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static DatabaseManager {
        GLOBAL_DB_MANAGER.get_or_init(DatabaseManager::new)
    }

    /// Get the shared handle for `db_path`, creating the file on first use
    pub fn get_or_create_database(&self, db_path: &Path) -> Result<Arc<Database>, DatabaseError> {
        let mut map = self.databases.lock().map_err(|_| DatabaseError::Poisoned)?;

        if let Some(existing) = map.get(db_path) {
            tracing::debug!("🔄 Reusing database handle for {}", db_path.display());
            return Ok(existing.clone());
        }

        let db = Self::create_database(db_path)?;
        map.insert(db_path.to_path_buf(), db.clone());
        Ok(db)
    }

    fn create_database(db_path: &Path) -> Result<Arc<Database>, DatabaseError> {
        let open_error = |message: String| DatabaseError::Open {
            path: db_path.to_path_buf(),
            message,
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| open_error(e.to_string()))?;
        }

        tracing::info!("🗄️  Opening database {}", db_path.display());
        let db = Database::create(db_path).map_err(|e| open_error(e.to_string()))?;
        Ok(Arc::new(db))
    }

    /// Drop the registry's handle; the file closes once every user releases it
    pub fn close_database(&self, db_path: &Path) -> Result<bool, DatabaseError> {
        let mut map = self.databases.lock().map_err(|_| DatabaseError::Poisoned)?;
        let removed = map.remove(db_path).is_some();
        if removed {
            tracing::info!("🗑️  Closed database {}", db_path.display());
        }
        Ok(removed)
    }

    pub fn open_paths(&self) -> Result<Vec<PathBuf>, DatabaseError> {
        let map = self.databases.lock().map_err(|_| DatabaseError::Poisoned)?;
        Ok(map.keys().cloned().collect())
    }
}

/// Run closures inside redb transactions with the error plumbing in one place
pub struct DatabaseOperation;

impl DatabaseOperation {
    pub fn read<F, R, E>(db: &Database, operation: F) -> Result<R, E>
    where
        F: FnOnce(&redb::ReadTransaction) -> Result<R, E>,
        E: From<DatabaseError>,
    {
        let read_txn = db.begin_read().map_err(DatabaseError::from)?;
        operation(&read_txn)
    }

    /// The transaction commits only when `operation` succeeds
    pub fn write<F, R, E>(db: &Database, operation: F) -> Result<R, E>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<R, E>,
        E: From<DatabaseError>,
    {
        let write_txn = db.begin_write().map_err(DatabaseError::from)?;
        let result = operation(&write_txn)?;
        write_txn.commit().map_err(DatabaseError::from)?;
        Ok(result)
    }
}
