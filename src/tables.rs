use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::columns::{self, Column, OrderedColumns};
use crate::database::Database;
use crate::error::StoreError;
use crate::etags::SyncEtags;
use crate::kvs::{KeyValueStore, KeyValueStoreEntry};
use crate::rows::{self, DataValue, SyncState};

/// Catalog record of one synchronized table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableDefinitionEntry {
    pub table_id: String,
    pub schema_etag: Option<String>,
    pub last_data_etag: Option<String>,
    pub last_sync_time: Option<String>,
    pub rev_id: String,
}

/// Sync-relevant condition of a table's rows.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TableHealth {
    pub has_checkpoints: bool,
    pub has_conflicts: bool,
    pub has_changes: bool,
}

/// Rotate the rev_id of a table, creating the definition entry if the
/// metadata arrives before the table itself (properties import order).
pub(crate) fn rotate_rev_id(conn: &Connection, table_id: &str) -> Result<(), StoreError> {
    let rev_id = Uuid::new_v4().to_string();
    let updated = conn.execute(
        "UPDATE _table_definitions SET _rev_id = ? WHERE _table_id = ?",
        params![rev_id, table_id],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO _table_definitions (_table_id, _rev_id) VALUES (?, ?)",
            params![table_id, rev_id],
        )?;
    }
    Ok(())
}

pub(crate) fn get_rev_id(conn: &Connection, table_id: &str) -> Result<String, StoreError> {
    let rev: Option<String> = conn
        .query_row(
            "SELECT _rev_id FROM _table_definitions WHERE _table_id = ?",
            [table_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(rev.unwrap_or_default())
}

fn validate_user_table_id(table_id: &str) -> Result<(), StoreError> {
    if table_id.is_empty() {
        return Err(StoreError::Invalid("tableId must be specified".to_string()));
    }
    let mut chars = table_id.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);
    if !first_ok || !table_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::Invalid(format!(
            "tableId '{table_id}' is not a valid identifier"
        )));
    }
    Ok(())
}

fn physical_table_exists(conn: &Connection, table_id: &str) -> Result<bool, StoreError> {
    let count: i32 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
        [table_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub struct Tables;

impl Tables {
    /// Create the physical table, its column definitions and its catalog
    /// entry, or verify that the declared columns match what exists.
    pub fn create_or_open_table_with_columns(
        db: &Database,
        table_id: &str,
        columns: Vec<Column>,
    ) -> Result<OrderedColumns, StoreError> {
        Self::create_or_open_table_with_columns_and_properties(db, table_id, columns, &[], false)
    }

    /// As above, additionally writing table metadata. When `clear` is true
    /// (or the table was freshly created) prior metadata is deleted first.
    pub fn create_or_open_table_with_columns_and_properties(
        db: &Database,
        table_id: &str,
        columns: Vec<Column>,
        metadata: &[KeyValueStoreEntry],
        clear: bool,
    ) -> Result<OrderedColumns, StoreError> {
        validate_user_table_id(table_id)?;
        let ordered = OrderedColumns::build(table_id, columns)?;

        crate::database::with_transaction(&db.conn, |conn| {
            let created = if physical_table_exists(conn, table_id)? {
                Self::verify_table_schema(conn, &ordered)?;
                false
            } else {
                debug!("Creating user table '{table_id}'");
                Self::create_user_table(conn, &ordered)?;
                ordered.persist(conn)?;
                rotate_rev_id(conn, table_id)?;
                true
            };
            KeyValueStore::replace_table_metadata(conn, table_id, metadata, clear || created)
        })?;
        Ok(ordered)
    }

    fn create_user_table(conn: &Connection, ordered: &OrderedColumns) -> Result<(), StoreError> {
        let mut b = format!("CREATE TABLE IF NOT EXISTS \"{}\" (", ordered.table_id);
        rows::append_admin_columns_ddl(&mut b);
        for defn in ordered.retained() {
            b.push_str(", \"");
            b.push_str(defn.element_key());
            b.push_str("\" ");
            b.push_str(defn.data_type.storage_type());
            b.push_str(" NULL");
        }
        b.push(')');
        conn.execute(&b, [])?;
        Ok(())
    }

    /// Declared columns must agree exactly with what is on disk: same
    /// element keys, names, types and child lists.
    fn verify_table_schema(conn: &Connection, ordered: &OrderedColumns) -> Result<(), StoreError> {
        let existing = columns::get_user_defined_columns(conn, &ordered.table_id)?;
        let declared = ordered.columns();
        if existing.len() != declared.len() {
            return Err(StoreError::SchemaMismatch {
                table_id: ordered.table_id.clone(),
                reason: format!(
                    "table has {} columns but {} were declared",
                    existing.len(),
                    declared.len()
                ),
            });
        }
        // both sides are ordered by element key
        for (have, want) in existing.iter().zip(declared.iter()) {
            if have != want {
                return Err(StoreError::SchemaMismatch {
                    table_id: ordered.table_id.clone(),
                    reason: format!(
                        "column '{}' differs from the declared column '{}'",
                        have.element_key, want.element_key
                    ),
                });
            }
        }
        Ok(())
    }

    /// Remove the table and every catalog trace of it, then ask the
    /// attachment collaborator to remove its files.
    pub fn delete_table_and_all_data(db: &Database, table_id: &str) -> Result<(), StoreError> {
        validate_user_table_id(table_id)?;
        crate::database::with_transaction(&db.conn, |conn| {
            conn.execute(&format!("DROP TABLE IF EXISTS \"{table_id}\""), [])?;
            conn.execute(
                "DELETE FROM _column_definitions WHERE _table_id = ?",
                [table_id],
            )?;
            KeyValueStore::delete_table_metadata(conn, table_id)?;
            conn.execute(
                "DELETE FROM _table_definitions WHERE _table_id = ?",
                [table_id],
            )?;
            SyncEtags::delete_all_for_table(conn, table_id)
        })?;
        db.attachments().delete_table_attachments(table_id)
    }

    pub fn has_table_id(db: &Database, table_id: &str) -> Result<bool, StoreError> {
        let count: i32 = db.conn.query_row(
            "SELECT count(*) FROM _table_definitions WHERE _table_id = ?",
            [table_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_all_table_ids(db: &Database) -> Result<Vec<String>, StoreError> {
        let mut stmt = db
            .conn
            .prepare("SELECT _table_id FROM _table_definitions ORDER BY _table_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn get_table_definition_entry(
        db: &Database,
        table_id: &str,
    ) -> Result<Option<TableDefinitionEntry>, StoreError> {
        db.conn
            .query_row(
                "SELECT _table_id, _schema_etag, _last_data_etag, _last_sync_time, _rev_id
                 FROM _table_definitions WHERE _table_id = ?",
                [table_id],
                |row| {
                    Ok(TableDefinitionEntry {
                        table_id: row.get(0)?,
                        schema_etag: row.get(1)?,
                        last_data_etag: row.get(2)?,
                        last_sync_time: row.get(3)?,
                        rev_id: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Storage)
    }

    /// Current metadata revision token of a table. Empty when the table is
    /// unknown. Callers cache table metadata against this value.
    pub fn get_table_defs_rev_id(db: &Database, table_id: &str) -> Result<String, StoreError> {
        get_rev_id(&db.conn, table_id)
    }

    /// Record the server's etags after a sync round. Sync engine only.
    pub fn privileged_update_table_etags(
        db: &Database,
        table_id: &str,
        schema_etag: Option<&str>,
        last_data_etag: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated = db.conn.execute(
            "UPDATE _table_definitions SET _schema_etag = ?, _last_data_etag = ? WHERE _table_id = ?",
            params![schema_etag, last_data_etag, table_id],
        )?;
        if updated == 0 {
            return Err(StoreError::RowNotFound(table_id.to_string()));
        }
        Ok(())
    }

    pub fn privileged_update_table_last_sync_time(
        db: &Database,
        table_id: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let updated = db.conn.execute(
            "UPDATE _table_definitions SET _last_sync_time = ? WHERE _table_id = ?",
            params![now, table_id],
        )?;
        if updated == 0 {
            return Err(StoreError::RowNotFound(table_id.to_string()));
        }
        Ok(())
    }

    pub fn get_table_health(db: &Database, table_id: &str) -> Result<TableHealth, StoreError> {
        let sql = format!(
            "SELECT
               EXISTS (SELECT 1 FROM \"{t}\" WHERE {sp_type} IS NULL),
               EXISTS (SELECT 1 FROM \"{t}\" WHERE {state} = ?),
               EXISTS (SELECT 1 FROM \"{t}\" WHERE {state} NOT IN (?, ?))",
            t = table_id,
            sp_type = rows::SAVEPOINT_TYPE,
            state = rows::SYNC_STATE,
        );
        db.conn
            .query_row(
                &sql,
                params![
                    SyncState::InConflict.as_ref(),
                    SyncState::Synced.as_ref(),
                    SyncState::SyncedPendingFiles.as_ref()
                ],
                |row| {
                    Ok(TableHealth {
                        has_checkpoints: row.get(0)?,
                        has_conflicts: row.get(1)?,
                        has_changes: row.get(2)?,
                    })
                },
            )
            .map_err(StoreError::Storage)
    }

    /// Export column set for CSV collaborators: admin columns minus the
    /// purely local sync bookkeeping.
    pub fn export_columns() -> Vec<&'static str> {
        rows::EXPORT_COLUMNS.to_vec()
    }
}

/// Local-only tables: device-private datasets with no admin columns and no
/// participation in sync or row-level access control.
pub struct LocalOnlyTables;

impl LocalOnlyTables {
    pub fn create_local_only_table(
        db: &Database,
        table_id: &str,
        columns: Vec<Column>,
    ) -> Result<OrderedColumns, StoreError> {
        validate_user_table_id(table_id)?;
        let ordered = OrderedColumns::build(table_id, columns)?;
        let conn = &db.conn;

        if physical_table_exists(conn, table_id)? {
            return Ok(ordered);
        }
        let mut b = format!("CREATE TABLE IF NOT EXISTS \"{table_id}\" (");
        let mut first = true;
        for defn in ordered.retained() {
            if !first {
                b.push_str(", ");
            }
            first = false;
            b.push('"');
            b.push_str(defn.element_key());
            b.push_str("\" ");
            b.push_str(defn.data_type.storage_type());
            b.push_str(" NULL");
        }
        b.push(')');
        conn.execute(&b, [])?;
        Ok(ordered)
    }

    pub fn delete_local_only_table(db: &Database, table_id: &str) -> Result<(), StoreError> {
        validate_user_table_id(table_id)?;
        db.conn
            .execute(&format!("DROP TABLE IF EXISTS \"{table_id}\""), [])?;
        Ok(())
    }

    pub fn insert_local_only_row(
        db: &Database,
        table_id: &str,
        values: &[(String, DataValue)],
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Err(StoreError::Invalid("no values to insert".to_string()));
        }
        let mut b = format!("INSERT INTO \"{table_id}\" (");
        let mut placeholders = String::new();
        for (i, (name, _)) in values.iter().enumerate() {
            if i > 0 {
                b.push_str(", ");
                placeholders.push_str(", ");
            }
            b.push('"');
            b.push_str(name);
            b.push('"');
            placeholders.push('?');
        }
        b.push_str(") VALUES (");
        b.push_str(&placeholders);
        b.push(')');
        db.conn.execute(
            &b,
            rusqlite::params_from_iter(values.iter().map(|(_, v)| v)),
        )?;
        Ok(())
    }

    pub fn update_local_only_rows(
        db: &Database,
        table_id: &str,
        values: &[(String, DataValue)],
        where_clause: Option<&str>,
        where_args: &[DataValue],
    ) -> Result<usize, StoreError> {
        if values.is_empty() {
            return Err(StoreError::Invalid("no values to update".to_string()));
        }
        let mut b = format!("UPDATE \"{table_id}\" SET ");
        for (i, (name, _)) in values.iter().enumerate() {
            if i > 0 {
                b.push_str(", ");
            }
            b.push('"');
            b.push_str(name);
            b.push_str("\" = ?");
        }
        if let Some(clause) = where_clause {
            b.push_str(" WHERE ");
            b.push_str(clause);
        }
        let args = values
            .iter()
            .map(|(_, v)| v)
            .chain(where_args.iter());
        let changed = db.conn.execute(&b, rusqlite::params_from_iter(args))?;
        Ok(changed)
    }

    pub fn delete_local_only_rows(
        db: &Database,
        table_id: &str,
        where_clause: Option<&str>,
        where_args: &[DataValue],
    ) -> Result<usize, StoreError> {
        let mut b = format!("DELETE FROM \"{table_id}\"");
        if let Some(clause) = where_clause {
            b.push_str(" WHERE ");
            b.push_str(clause);
        }
        let changed = db
            .conn
            .execute(&b, rusqlite::params_from_iter(where_args.iter()))?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn survey_columns() -> Vec<Column> {
        vec![
            Column::new("name", "name", "string", None),
            Column::new("age", "age", "integer", None),
            Column::new("weight", "weight", "number", None),
        ]
    }

    #[test]
    fn create_then_reopen_with_same_columns() {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns(&db, "survey", survey_columns()).unwrap();
        // identical declaration opens cleanly
        Tables::create_or_open_table_with_columns(&db, "survey", survey_columns()).unwrap();

        let names = columns::get_all_column_names(&db.conn, "survey").unwrap();
        assert!(names.contains(&"_id".to_string()));
        assert!(names.contains(&"name".to_string()));
        assert_eq!(names.len(), 14 + 3);
    }

    #[test]
    fn reopen_with_different_columns_fails() {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns(&db, "survey", survey_columns()).unwrap();

        let mut changed = survey_columns();
        changed[1] = Column::new("age", "age", "string", None);
        let err = Tables::create_or_open_table_with_columns(&db, "survey", changed).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn drop_table_clears_catalog() {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns_and_properties(
            &db,
            "survey",
            survey_columns(),
            &[KeyValueStoreEntry::new(
                "survey",
                crate::kvs::PARTITION_TABLE,
                crate::kvs::ASPECT_DEFAULT,
                "displayName",
                crate::columns::ElementDataType::Object,
                r#""Survey""#,
            )],
            false,
        )
        .unwrap();

        Tables::delete_table_and_all_data(&db, "survey").unwrap();

        assert!(!Tables::has_table_id(&db, "survey").unwrap());
        assert!(!physical_table_exists(&db.conn, "survey").unwrap());
        let kvs_count: i64 = db
            .conn
            .query_row(
                "SELECT count(*) FROM _key_value_store_active WHERE _table_id = 'survey'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(kvs_count, 0);
        let col_count: i64 = db
            .conn
            .query_row(
                "SELECT count(*) FROM _column_definitions WHERE _table_id = 'survey'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(col_count, 0);
    }

    #[test]
    fn rev_id_rotates_on_metadata_write() {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns(&db, "survey", survey_columns()).unwrap();
        let before = get_rev_id(&db.conn, "survey").unwrap();
        KeyValueStore::set_entry(
            &db.conn,
            &KeyValueStoreEntry::new(
                "survey",
                crate::kvs::PARTITION_TABLE,
                crate::kvs::ASPECT_DEFAULT,
                "indexCol",
                crate::columns::ElementDataType::String,
                "name",
            ),
        )
        .unwrap();
        let after = get_rev_id(&db.conn, "survey").unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn table_ids_listed_sorted() {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns(&db, "zebra", survey_columns()).unwrap();
        Tables::create_or_open_table_with_columns(&db, "apple", survey_columns()).unwrap();
        assert_eq!(
            Tables::get_all_table_ids(&db).unwrap(),
            vec!["apple".to_string(), "zebra".to_string()]
        );
    }

    #[test]
    fn invalid_table_id_rejected() {
        let db = Database::open_in_memory().unwrap();
        for bad in ["", "_private", "bad-id", "no;drop"] {
            assert!(
                Tables::create_or_open_table_with_columns(&db, bad, survey_columns()).is_err(),
                "accepted '{bad}'"
            );
        }
    }

    #[test]
    fn local_only_table_round_trip() {
        let db = Database::open_in_memory().unwrap();
        LocalOnlyTables::create_local_only_table(
            &db,
            "scratch",
            vec![Column::new("note", "note", "string", None)],
        )
        .unwrap();
        LocalOnlyTables::insert_local_only_row(
            &db,
            "scratch",
            &[("note".to_string(), DataValue::Text("hello".to_string()))],
        )
        .unwrap();
        let changed = LocalOnlyTables::update_local_only_rows(
            &db,
            "scratch",
            &[("note".to_string(), DataValue::Text("bye".to_string()))],
            Some("note = ?"),
            &[DataValue::Text("hello".to_string())],
        )
        .unwrap();
        assert_eq!(changed, 1);
        let removed =
            LocalOnlyTables::delete_local_only_rows(&db, "scratch", None, &[]).unwrap();
        assert_eq!(removed, 1);

        let names = columns::get_all_column_names(&db.conn, "scratch").unwrap();
        assert_eq!(names, vec!["note".to_string()]);
    }
}
