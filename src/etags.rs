use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// Per-instance sync etags: the last-known server content hashes for
/// manifests and attachment files, keyed by URL. These are advisory cache
/// records for the sync transport; dropping a table or drifting its schema
/// invalidates them wholesale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEtag {
    pub table_id: String,
    pub is_manifest: bool,
    pub url: String,
    pub last_modified: String,
    pub etag_md5_hash: String,
}

pub struct SyncEtags;

impl SyncEtags {
    pub fn update_etag(conn: &Connection, etag: &SyncEtag) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO _sync_etags
               (_table_id, _is_manifest, _url, _last_modified, _etag_md5_hash)
             VALUES (?, ?, ?, ?, ?)",
            params![
                etag.table_id,
                etag.is_manifest,
                etag.url,
                etag.last_modified,
                etag.etag_md5_hash
            ],
        )?;
        Ok(())
    }

    pub fn get_etag(
        conn: &Connection,
        table_id: &str,
        is_manifest: bool,
        url: &str,
    ) -> Result<Option<String>, StoreError> {
        conn.query_row(
            "SELECT _etag_md5_hash FROM _sync_etags
             WHERE _table_id = ? AND _is_manifest = ? AND _url = ?",
            params![table_id, is_manifest, url],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::Storage)
    }

    pub fn delete_all_for_table(conn: &Connection, table_id: &str) -> Result<(), StoreError> {
        conn.execute("DELETE FROM _sync_etags WHERE _table_id = ?", [table_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn upsert_read_and_table_invalidation() {
        let db = Database::open_in_memory().unwrap();
        let etag = SyncEtag {
            table_id: "survey".to_string(),
            is_manifest: false,
            url: "https://server/files/survey/a.jpg".to_string(),
            last_modified: "2025-03-01T00:00:00.000Z".to_string(),
            etag_md5_hash: "abc123".to_string(),
        };
        SyncEtags::update_etag(&db.conn, &etag).unwrap();
        assert_eq!(
            SyncEtags::get_etag(&db.conn, "survey", false, &etag.url).unwrap(),
            Some("abc123".to_string())
        );

        SyncEtags::delete_all_for_table(&db.conn, "survey").unwrap();
        assert_eq!(
            SyncEtags::get_etag(&db.conn, "survey", false, &etag.url).unwrap(),
            None
        );
    }
}
