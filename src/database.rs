use std::path::Path;
use std::time::Duration;

use log::debug;
use rusqlite::Connection;

use crate::attachments::{AttachmentStore, FsAttachments, NoopAttachments};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::schema::{CREATE_SCHEMA_SQL, TABLE_DEFS_TABLE};

/// One open store: a SQLite connection plus the attachment collaborator.
///
/// A `Database` is single-threaded; callers that need concurrency open
/// additional connections to the same file. Writes within one connection
/// are linearly ordered.
pub struct Database {
    pub conn: Connection,
    attachments: Box<dyn AttachmentStore>,
}

/// Run `f` inside a transaction. A transaction already in progress on this
/// connection is reused; the outermost caller commits or rolls back.
pub(crate) fn with_transaction<T, F>(conn: &Connection, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }
    conn.execute_batch("BEGIN")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

impl Database {
    pub fn open(db_path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        debug!("Database opened at: {}", db_path.display());
        let attachments: Box<dyn AttachmentStore> = match &config.attachments_root {
            Some(root) => Box::new(FsAttachments::new(root.clone())),
            None => Box::new(NoopAttachments),
        };
        Self::from_connection(conn, attachments, config)
    }

    /// In-memory store with no attachment side effects. Test harnesses and
    /// throwaway sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Box::new(NoopAttachments), &StoreConfig::default())
    }

    /// Substitute a custom attachment collaborator (test doubles).
    pub fn from_connection(
        conn: Connection,
        attachments: Box<dyn AttachmentStore>,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Database { conn, attachments };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn attachments(&self) -> &dyn AttachmentStore {
        self.attachments.as_ref()
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let table_exists: bool = self
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
                [TABLE_DEFS_TABLE],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            debug!("Creating catalog tables");
            self.conn.execute_batch(CREATE_SCHEMA_SQL)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_tables_created_on_open() {
        let db = Database::open_in_memory().unwrap();
        let count: i32 = db
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name LIKE '\\_%' ESCAPE '\\'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn reopen_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        let config = StoreConfig::default();
        {
            Database::open(&path, &config).unwrap();
        }
        // second open must find the schema already present
        Database::open(&path, &config).unwrap();
    }
}
