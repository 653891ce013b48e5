use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the SQLite database.
///
/// One connection guarded by a mutex; SQLite serializes writers anyway and
/// this keeps transaction scoping simple. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::wrap(Connection::open(path)?, Some(path.to_path_buf()))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::wrap(Connection::open_in_memory()?, None)
    }

    fn wrap(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(schema::PRAGMAS)?;
            conn.execute_batch(schema::CREATE_TABLES)?;
            Ok(())
        })
    }

    /// Run a closure with the locked connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        f(&guard)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_initializes_schema() {
        let db = Database::in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('sessions','events')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn clones_share_connection() {
        let db = Database::in_memory().unwrap();
        let db2 = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, status, created_at, updated_at) VALUES ('sess_1', 't', 'active', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let count: i64 = db2
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }
}
