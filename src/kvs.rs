use std::collections::HashMap;

use log::warn;
use once_cell::sync::Lazy;
use rusqlite::{params, Connection};

use crate::columns::ElementDataType;
use crate::error::StoreError;
use crate::tables;

pub const PARTITION_TABLE: &str = "Table";
pub const PARTITION_COLUMN: &str = "Column";
pub const ASPECT_DEFAULT: &str = "default";

// table security settings
pub const ASPECT_SECURITY: &str = "security";
pub const KEY_LOCKED: &str = "locked";
pub const KEY_UNVERIFIED_USER_CAN_CREATE: &str = "unverifiedUserCanCreate";
pub const KEY_DEFAULT_ACCESS_ON_CREATION: &str = "defaultAccessOnCreation";

/// Value-type restrictions for well-known (partition, key) pairs. Stores
/// written by older clients sometimes carry the wrong type tag; these are
/// coerced on write rather than rejected (forward-compatibility policy).
static KVS_TYPE_RESTRICTIONS: Lazy<HashMap<(&'static str, &'static str), ElementDataType>> =
    Lazy::new(|| {
        let mut m = HashMap::new();
        // for columns
        m.insert((PARTITION_COLUMN, "displayChoicesList"), ElementDataType::String);
        m.insert((PARTITION_COLUMN, "displayFormat"), ElementDataType::String);
        m.insert((PARTITION_COLUMN, "displayName"), ElementDataType::Object);
        m.insert((PARTITION_COLUMN, "displayVisible"), ElementDataType::Bool);
        m.insert((PARTITION_COLUMN, "joins"), ElementDataType::Array);
        // and for the table
        m.insert((PARTITION_TABLE, "colOrder"), ElementDataType::Array);
        m.insert((PARTITION_TABLE, "displayName"), ElementDataType::Object);
        m.insert((PARTITION_TABLE, "groupByCols"), ElementDataType::Array);
        m.insert((PARTITION_TABLE, "indexCol"), ElementDataType::String);
        m.insert((PARTITION_TABLE, "sortCol"), ElementDataType::Object);
        m.insert((PARTITION_TABLE, "sortOrder"), ElementDataType::Object);
        m
    });

/// One entry of the active key/value store. The 4-tuple
/// (table_id, partition, aspect, key) is the primary index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValueStoreEntry {
    pub table_id: String,
    pub partition: String,
    pub aspect: String,
    pub key: String,
    pub value_type: String,
    pub value: Option<String>,
}

impl KeyValueStoreEntry {
    pub fn new(
        table_id: &str,
        partition: &str,
        aspect: &str,
        key: &str,
        value_type: ElementDataType,
        value: &str,
    ) -> Self {
        KeyValueStoreEntry {
            table_id: table_id.to_owned(),
            partition: partition.to_owned(),
            aspect: aspect.to_owned(),
            key: key.to_owned(),
            value_type: value_type.to_string(),
            value: Some(value.to_owned()),
        }
    }

    fn validate_identity(&self) -> Result<(), StoreError> {
        if self.table_id.is_empty()
            || self.partition.is_empty()
            || self.aspect.is_empty()
            || self.key.is_empty()
        {
            return Err(StoreError::Invalid(
                "KVS entry requires tableId, partition, aspect and key".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the static restriction map. Returns the value type to store,
    /// coercing and logging when the declared type is wrong.
    fn enforced_type(&self) -> String {
        if let Some(required) =
            KVS_TYPE_RESTRICTIONS.get(&(self.partition.as_str(), self.key.as_str()))
        {
            if self.value_type != required.as_ref() {
                warn!(
                    "Client Error: KVS value type reset from {} to {} table: {} partition: {} key: {}",
                    self.value_type, required, self.table_id, self.partition, self.key
                );
                return required.to_string();
            }
        }
        self.value_type.clone()
    }
}

/// Light syntactic check of a value against its (enforced) type tag.
fn check_value_shape(value_type: &str, value: &str) -> Result<(), StoreError> {
    let malformed = |why: &str| {
        Err(StoreError::InvalidValueShape(format!(
            "{why}: type '{value_type}' value '{value}'"
        )))
    };
    match value_type.parse::<ElementDataType>() {
        Ok(ElementDataType::Integer) => {
            if value.parse::<i64>().is_err() {
                return malformed("not an integer");
            }
        }
        Ok(ElementDataType::Number) => {
            if value.parse::<f64>().is_err() {
                return malformed("not a number");
            }
        }
        Ok(ElementDataType::Bool) => {
            if !matches!(value, "true" | "false" | "0" | "1") {
                return malformed("not a boolean");
            }
        }
        Ok(ElementDataType::Array) => {
            if !(value.starts_with('[') && value.ends_with(']')) {
                return malformed("array value must be bracketed");
            }
        }
        Ok(ElementDataType::Object) => {
            // objects arrive either as JSON maps or as bare JSON strings
            let braced = value.starts_with('{') && value.ends_with('}');
            let quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
            if !(braced || quoted) {
                return malformed("object value must be braced or quoted");
            }
        }
        _ => {}
    }
    Ok(())
}

pub struct KeyValueStore;

impl KeyValueStore {
    /// Upsert one metadata entry, or delete it when the value is absent or
    /// empty. Every accepted mutation rotates the table's rev_id.
    pub fn set_entry(conn: &Connection, entry: &KeyValueStoreEntry) -> Result<(), StoreError> {
        entry.validate_identity()?;

        match entry.value.as_deref() {
            None | Some("") => {
                conn.execute(
                    "DELETE FROM _key_value_store_active
                     WHERE _table_id = ? AND _partition = ? AND _aspect = ? AND _key = ?",
                    params![entry.table_id, entry.partition, entry.aspect, entry.key],
                )?;
            }
            Some(value) => {
                let value_type = entry.enforced_type();
                check_value_shape(&value_type, value)?;
                conn.execute(
                    "INSERT OR REPLACE INTO _key_value_store_active
                       (_table_id, _partition, _aspect, _key, _type, _value)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        entry.table_id,
                        entry.partition,
                        entry.aspect,
                        entry.key,
                        value_type,
                        value
                    ],
                )?;
            }
        }
        tables::rotate_rev_id(conn, &entry.table_id)?;
        Ok(())
    }

    /// Filtered read. Absent filters act as wildcards. The returned rev_id
    /// is a snapshot token; callers compare it to invalidate caches.
    pub fn get_entries(
        conn: &Connection,
        table_id: &str,
        partition: Option<&str>,
        aspect: Option<&str>,
        key: Option<&str>,
    ) -> Result<(Vec<KeyValueStoreEntry>, String), StoreError> {
        let mut sql = String::from(
            "SELECT _table_id, _partition, _aspect, _key, _type, _value
             FROM _key_value_store_active WHERE _table_id = ?",
        );
        let mut args: Vec<&str> = vec![table_id];
        if let Some(partition) = partition {
            sql.push_str(" AND _partition = ?");
            args.push(partition);
        }
        if let Some(aspect) = aspect {
            sql.push_str(" AND _aspect = ?");
            args.push(aspect);
        }
        if let Some(key) = key {
            sql.push_str(" AND _key = ?");
            args.push(key);
        }
        sql.push_str(" ORDER BY _partition, _aspect, _key");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok(KeyValueStoreEntry {
                table_id: row.get(0)?,
                partition: row.get(1)?,
                aspect: row.get(2)?,
                key: row.get(3)?,
                value_type: row.get(4)?,
                value: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        let rev_id = tables::get_rev_id(conn, table_id)?;
        Ok((entries, rev_id))
    }

    /// Replace or merge the metadata of one table. With `clear` the prior
    /// entries for the table are deleted first. Rotates rev_id once.
    pub(crate) fn replace_table_metadata(
        conn: &Connection,
        table_id: &str,
        entries: &[KeyValueStoreEntry],
        clear: bool,
    ) -> Result<(), StoreError> {
        if clear {
            conn.execute(
                "DELETE FROM _key_value_store_active WHERE _table_id = ?",
                [table_id],
            )?;
        }
        for entry in entries {
            if entry.table_id != table_id {
                return Err(StoreError::Invalid(format!(
                    "metadata entry for table '{}' supplied while writing table '{table_id}'",
                    entry.table_id
                )));
            }
            entry.validate_identity()?;
            let value = match entry.value.as_deref() {
                None | Some("") => continue,
                Some(v) => v,
            };
            let value_type = entry.enforced_type();
            check_value_shape(&value_type, value)?;
            conn.execute(
                "INSERT OR REPLACE INTO _key_value_store_active
                   (_table_id, _partition, _aspect, _key, _type, _value)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    table_id,
                    entry.partition,
                    entry.aspect,
                    entry.key,
                    value_type,
                    value
                ],
            )?;
        }
        tables::rotate_rev_id(conn, table_id)?;
        Ok(())
    }

    pub(crate) fn delete_table_metadata(
        conn: &Connection,
        table_id: &str,
    ) -> Result<(), StoreError> {
        conn.execute(
            "DELETE FROM _key_value_store_active WHERE _table_id = ?",
            [table_id],
        )?;
        Ok(())
    }
}
