use std::collections::BTreeMap;

use chrono::Utc;
use log::debug;
use once_cell::sync::Lazy;
use rusqlite::types::Value;
use rusqlite::{Connection, ToSql};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::access::{RowChange, TableSecuritySettings, UserContext};
use crate::columns::{ColumnDefinition, ElementDataType, OrderedColumns};
use crate::database::{with_transaction, Database};
use crate::error::StoreError;

pub const ID: &str = "_id";
pub const ROW_ETAG: &str = "_row_etag";
pub const SYNC_STATE: &str = "_sync_state";
pub const CONFLICT_TYPE: &str = "_conflict_type";
pub const DEFAULT_ACCESS: &str = "_default_access";
pub const ROW_OWNER: &str = "_row_owner";
pub const GROUP_READ_ONLY: &str = "_group_read_only";
pub const GROUP_MODIFY: &str = "_group_modify";
pub const GROUP_PRIVILEGED: &str = "_group_privileged";
pub const FORM_ID: &str = "_form_id";
pub const LOCALE: &str = "_locale";
pub const SAVEPOINT_TYPE: &str = "_savepoint_type";
pub const SAVEPOINT_TIMESTAMP: &str = "_savepoint_timestamp";
pub const SAVEPOINT_CREATOR: &str = "_savepoint_creator";

/// Computed projection column, never stored.
pub const EFFECTIVE_ACCESS: &str = "_effective_access";

/// Admin columns present on every synchronized row, sorted by name.
pub static ADMIN_COLUMNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut cols = vec![
        ID,
        ROW_ETAG,
        SYNC_STATE,
        CONFLICT_TYPE,
        DEFAULT_ACCESS,
        ROW_OWNER,
        GROUP_READ_ONLY,
        GROUP_MODIFY,
        GROUP_PRIVILEGED,
        FORM_ID,
        LOCALE,
        SAVEPOINT_TYPE,
        SAVEPOINT_TIMESTAMP,
        SAVEPOINT_CREATOR,
    ];
    cols.sort_unstable();
    cols
});

/// Admin columns that accompany user data in CSV exports. The sync
/// bookkeeping columns stay local.
pub static EXPORT_COLUMNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut cols = vec![
        ID,
        ROW_ETAG,
        DEFAULT_ACCESS,
        ROW_OWNER,
        GROUP_READ_ONLY,
        GROUP_MODIFY,
        GROUP_PRIVILEGED,
        FORM_ID,
        LOCALE,
        SAVEPOINT_TYPE,
        SAVEPOINT_TIMESTAMP,
        SAVEPOINT_CREATOR,
    ];
    cols.sort_unstable();
    cols
});

/// The five permission columns consulted by the access policy.
pub(crate) const PERMISSION_COLUMNS: [&str; 5] = [
    DEFAULT_ACCESS,
    ROW_OWNER,
    GROUP_READ_ONLY,
    GROUP_MODIFY,
    GROUP_PRIVILEGED,
];

/// Admin column DDL in creation order, appended to a CREATE TABLE body.
pub(crate) fn append_admin_columns_ddl(b: &mut String) {
    b.push_str(&format!(
        "{ID} TEXT NOT NULL, \
         {ROW_ETAG} TEXT NULL, \
         {SYNC_STATE} TEXT NOT NULL, \
         {CONFLICT_TYPE} INTEGER NULL, \
         {DEFAULT_ACCESS} TEXT NULL, \
         {ROW_OWNER} TEXT NULL, \
         {GROUP_READ_ONLY} TEXT NULL, \
         {GROUP_MODIFY} TEXT NULL, \
         {GROUP_PRIVILEGED} TEXT NULL, \
         {FORM_ID} TEXT NULL, \
         {LOCALE} TEXT NULL, \
         {SAVEPOINT_TYPE} TEXT NULL, \
         {SAVEPOINT_TIMESTAMP} TEXT NOT NULL, \
         {SAVEPOINT_CREATOR} TEXT NULL"
    ));
}

/// Per-row relationship with the server.
#[derive(AsRefStr, EnumString, Display, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SyncState {
    #[strum(serialize = "new_row")]
    NewRow,
    #[strum(serialize = "changed")]
    Changed,
    #[strum(serialize = "deleted")]
    Deleted,
    #[strum(serialize = "synced")]
    Synced,
    #[strum(serialize = "synced_pending_files")]
    SyncedPendingFiles,
    #[strum(serialize = "in_conflict")]
    InConflict,
}

impl SyncState {
    pub fn is_synced_variant(&self) -> bool {
        matches!(self, SyncState::Synced | SyncState::SyncedPendingFiles)
    }
}

/// Which side of a conflict pair a row records, and what happened there.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ConflictType {
    LocalDeletedOld,
    LocalUpdatedUpdated,
    ServerDeletedOld,
    ServerUpdatedUpdated,
}

impl ConflictType {
    pub fn to_int(self) -> i64 {
        match self {
            ConflictType::LocalDeletedOld => 0,
            ConflictType::LocalUpdatedUpdated => 1,
            ConflictType::ServerDeletedOld => 2,
            ConflictType::ServerUpdatedUpdated => 3,
        }
    }

    pub fn from_int(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(ConflictType::LocalDeletedOld),
            1 => Ok(ConflictType::LocalUpdatedUpdated),
            2 => Ok(ConflictType::ServerDeletedOld),
            3 => Ok(ConflictType::ServerUpdatedUpdated),
            _ => Err(StoreError::Corruption(format!(
                "invalid conflict type {value}"
            ))),
        }
    }

    pub fn is_server_side(&self) -> bool {
        matches!(
            self,
            ConflictType::ServerDeletedOld | ConflictType::ServerUpdatedUpdated
        )
    }
}

/// Savepoint kind. Checkpoints (drafts) carry NULL instead.
#[derive(AsRefStr, EnumString, Display, Debug, PartialEq, Eq, Copy, Clone)]
pub enum SavepointType {
    #[strum(serialize = "INCOMPLETE")]
    Incomplete,
    #[strum(serialize = "COMPLETE")]
    Complete,
}

/// Row-level default access, stored in `_default_access`.
#[derive(AsRefStr, EnumString, Display, Debug, PartialEq, Eq, Copy, Clone)]
pub enum Access {
    #[strum(serialize = "FULL")]
    Full,
    #[strum(serialize = "MODIFY")]
    Modify,
    #[strum(serialize = "READ_ONLY")]
    ReadOnly,
    #[strum(serialize = "HIDDEN")]
    Hidden,
}

/// A caller-supplied column value: a tagged union over the storable
/// representations. Element types validate against it on write.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
}

impl DataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        match self {
            DataValue::Null => Value::Null,
            DataValue::Text(s) => Value::Text(s.clone()),
            DataValue::Integer(i) => Value::Integer(*i),
            DataValue::Real(r) => Value::Real(*r),
            DataValue::Bool(b) => Value::Integer(i64::from(*b)),
        }
    }

    /// Convert a JSON leaf into the storable value for a column of the
    /// given element type.
    pub fn from_json(
        data_type: ElementDataType,
        json: &serde_json::Value,
    ) -> Result<DataValue, StoreError> {
        use serde_json::Value as Json;
        let mismatch = || {
            Err(StoreError::InvalidValueShape(format!(
                "JSON value {json} does not fit element type '{data_type}'"
            )))
        };
        if json.is_null() {
            return Ok(DataValue::Null);
        }
        match data_type {
            ElementDataType::Integer => match json {
                Json::Number(n) => match n.as_i64() {
                    Some(i) => Ok(DataValue::Integer(i)),
                    None => mismatch(),
                },
                _ => mismatch(),
            },
            ElementDataType::Number => match json {
                Json::Number(n) => match n.as_f64() {
                    Some(f) => Ok(DataValue::Real(f)),
                    None => mismatch(),
                },
                _ => mismatch(),
            },
            ElementDataType::Bool => match json {
                Json::Bool(b) => Ok(DataValue::Bool(*b)),
                _ => mismatch(),
            },
            ElementDataType::Array => match json {
                Json::Array(_) => Ok(DataValue::Text(json.to_string())),
                _ => mismatch(),
            },
            ElementDataType::Object => Ok(DataValue::Text(json.to_string())),
            ElementDataType::String | ElementDataType::RowPath | ElementDataType::ConfigPath => {
                match json {
                    Json::String(s) => Ok(DataValue::Text(s.clone())),
                    _ => mismatch(),
                }
            }
        }
    }

    fn check_against(&self, data_type: ElementDataType) -> Result<(), StoreError> {
        let ok = match (data_type, self) {
            (_, DataValue::Null) => true,
            (ElementDataType::Integer, DataValue::Integer(_) | DataValue::Bool(_)) => true,
            (
                ElementDataType::Number,
                DataValue::Real(_) | DataValue::Integer(_),
            ) => true,
            (ElementDataType::Bool, DataValue::Bool(_)) => true,
            (ElementDataType::Bool, DataValue::Integer(i)) => *i == 0 || *i == 1,
            (
                ElementDataType::String
                | ElementDataType::RowPath
                | ElementDataType::ConfigPath
                | ElementDataType::Array
                | ElementDataType::Object,
                DataValue::Text(_),
            ) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidValueShape(format!(
                "value {self:?} does not fit element type '{data_type}'"
            )))
        }
    }
}

impl ToSql for DataValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(self.to_value()))
    }
}

/// Caller-supplied values for one row, keyed by column name.
pub type RowValues = BTreeMap<String, DataValue>;

pub(crate) fn savepoint_timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.9f").to_string()
}

/// A row read back with native storage types, keyed by column name.
#[derive(Clone, Debug)]
pub(crate) struct StoredRow {
    pub cols: BTreeMap<String, Value>,
}

pub(crate) fn value_to_opt_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(t) => Some(t.clone()),
        Value::Blob(_) => None,
    }
}

impl StoredRow {
    pub fn value(&self, col: &str) -> &Value {
        self.cols.get(col).unwrap_or(&Value::Null)
    }

    pub fn text(&self, col: &str) -> Option<String> {
        value_to_opt_string(self.value(col))
    }

    pub fn row_id(&self) -> String {
        self.text(ID).unwrap_or_default()
    }

    pub fn sync_state(&self) -> Result<SyncState, StoreError> {
        let raw = self.text(SYNC_STATE).ok_or_else(|| {
            StoreError::Corruption(format!("row '{}' has no sync state", self.row_id()))
        })?;
        raw.parse::<SyncState>().map_err(|_| {
            StoreError::Corruption(format!(
                "row '{}' has invalid sync state '{raw}'",
                self.row_id()
            ))
        })
    }

    pub fn conflict_type(&self) -> Result<Option<ConflictType>, StoreError> {
        match self.value(CONFLICT_TYPE) {
            Value::Null => Ok(None),
            Value::Integer(i) => ConflictType::from_int(*i).map(Some),
            other => Err(StoreError::Corruption(format!(
                "row '{}' has non-integer conflict type {other:?}",
                self.row_id()
            ))),
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.value(SAVEPOINT_TYPE), Value::Null)
    }
}

/// Read all rows for an id, checkpoints included, oldest savepoint first.
pub(crate) fn get_stored_rows(
    conn: &Connection,
    table_id: &str,
    row_id: &str,
) -> Result<Vec<StoredRow>, StoreError> {
    let sql = format!(
        "SELECT * FROM \"{table_id}\" WHERE {ID} = ? ORDER BY {SAVEPOINT_TIMESTAMP} ASC, {SAVEPOINT_TYPE} ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map([row_id], |row| {
        let mut cols = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            cols.insert(name.clone(), row.get::<_, Value>(i)?);
        }
        Ok(StoredRow { cols })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Resolve incoming values to storable columns: admin columns pass
/// through, retained user columns validate, and composite (non-retention)
/// JSON values flatten recursively onto their retained descendants.
pub(crate) fn clean_up_values_map(
    ordered: &OrderedColumns,
    values: &RowValues,
) -> Result<RowValues, StoreError> {
    let mut out = RowValues::new();
    for (name, value) in values {
        if name == EFFECTIVE_ACCESS {
            continue;
        }
        if ADMIN_COLUMNS.contains(&name.as_str()) {
            out.insert(name.clone(), value.clone());
            continue;
        }
        let defn = ordered.get(name).ok_or_else(|| {
            StoreError::Invalid(format!(
                "unrecognized column '{name}' for table '{}'",
                ordered.table_id
            ))
        })?;
        if defn.is_unit_of_retention {
            value.check_against(defn.data_type)?;
            out.insert(name.clone(), value.clone());
        } else {
            match value {
                DataValue::Null => continue,
                DataValue::Text(json) => {
                    let parsed: serde_json::Value =
                        serde_json::from_str(json).map_err(|e| {
                            StoreError::InvalidValueShape(format!(
                                "composite column '{name}' is not JSON: {e}"
                            ))
                        })?;
                    flatten_composite(ordered, defn, &parsed, &mut out)?;
                }
                other => {
                    return Err(StoreError::InvalidValueShape(format!(
                        "composite column '{name}' requires a JSON text value, got {other:?}"
                    )));
                }
            }
        }
    }
    Ok(out)
}

fn flatten_composite(
    ordered: &OrderedColumns,
    defn: &ColumnDefinition,
    json: &serde_json::Value,
    out: &mut RowValues,
) -> Result<(), StoreError> {
    let obj = json.as_object().ok_or_else(|| {
        StoreError::InvalidValueShape(format!(
            "composite column '{}' requires a JSON object",
            defn.element_key()
        ))
    })?;
    for child_key in &defn.children {
        let child = ordered.get(child_key).ok_or_else(|| {
            StoreError::Corruption(format!("column '{child_key}' missing from definitions"))
        })?;
        let field = match obj.get(child.element_name()) {
            Some(f) => f,
            None => continue,
        };
        if child.is_unit_of_retention {
            out.insert(
                child_key.clone(),
                DataValue::from_json(child.data_type, field)?,
            );
        } else {
            flatten_composite(ordered, child, field, out)?;
        }
    }
    Ok(())
}

fn count_rows_with_id(conn: &Connection, table_id: &str, row_id: &str) -> Result<i64, StoreError> {
    let sql = format!("SELECT count(*) FROM \"{table_id}\" WHERE {ID} = ?");
    conn.query_row(&sql, [row_id], |row| row.get(0))
        .map_err(StoreError::Storage)
}

fn run_insert(
    conn: &Connection,
    table_id: &str,
    columns: &[(String, Value)],
) -> Result<(), StoreError> {
    let mut b = format!("INSERT INTO \"{table_id}\" (");
    let mut placeholders = String::new();
    for (i, (name, _)) in columns.iter().enumerate() {
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
    conn.execute(
        &b,
        rusqlite::params_from_iter(columns.iter().map(|(_, v)| v)),
    )?;
    Ok(())
}

fn run_update(
    conn: &Connection,
    table_id: &str,
    columns: &[(String, Value)],
    row_id: &str,
) -> Result<(), StoreError> {
    let mut b = format!("UPDATE \"{table_id}\" SET ");
    for (i, (name, _)) in columns.iter().enumerate() {
        if i > 0 {
            b.push_str(", ");
        }
        b.push('"');
        b.push_str(name);
        b.push_str("\" = ?");
    }
    b.push_str(&format!(" WHERE {ID} = ?"));
    let args = columns
        .iter()
        .map(|(_, v)| v.clone())
        .chain(std::iter::once(Value::Text(row_id.to_owned())));
    conn.execute(&b, rusqlite::params_from_iter(args))?;
    Ok(())
}

pub struct Rows;

impl Rows {
    /// Insert a complete row. Fails with `DuplicateRow` if any row with
    /// this id exists.
    pub fn insert_row_with_id(
        db: &Database,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            Self::upsert(conn, ordered, values, row_id, user, false, false)
        })
    }

    /// Insert on behalf of the server: no policy checks, caller controls
    /// the sync bookkeeping columns.
    pub fn privileged_insert_row_with_id(
        db: &Database,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            Self::upsert(conn, ordered, values, row_id, user, false, true)
        })
    }

    /// Update the single existing row, merging the supplied user columns
    /// over the prior values.
    pub fn update_row_with_id(
        db: &Database,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            Self::upsert(conn, ordered, values, row_id, user, true, false)
        })
    }

    pub fn privileged_update_row_with_id(
        db: &Database,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            Self::upsert(conn, ordered, values, row_id, user, true, true)
        })
    }

    pub(crate) fn upsert(
        conn: &Connection,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
        update: bool,
        as_server_requested_change: bool,
    ) -> Result<(), StoreError> {
        let table_id = ordered.table_id.as_str();
        if row_id.is_empty() {
            return Err(StoreError::Invalid("rowId must be specified".to_string()));
        }
        let mut cleaned = clean_up_values_map(ordered, values)?;

        let tss = TableSecuritySettings::get(conn, table_id)?;
        let roles = user.roles()?;
        let roles_slice = roles.as_deref().map(Vec::as_slice);
        let specifies_permissions = PERMISSION_COLUMNS
            .iter()
            .any(|c| cleaned.contains_key(*c));

        let update_state;
        if update {
            let rows = get_stored_rows(conn, table_id, row_id)?;
            let prior = match rows.len() {
                0 => return Err(StoreError::RowNotFound(row_id.to_string())),
                1 => &rows[0],
                _ => {
                    if rows
                        .iter()
                        .any(|r| matches!(r.sync_state(), Ok(SyncState::InConflict)))
                    {
                        return Err(StoreError::RowInConflict(row_id.to_string()));
                    }
                    return Err(StoreError::RowHasCheckpoints(row_id.to_string()));
                }
            };
            let prior_state = prior.sync_state()?;

            if as_server_requested_change {
                update_state = match cleaned.get(SYNC_STATE).and_then(DataValue::as_text) {
                    Some(s) => s.parse::<SyncState>().map_err(|_| {
                        StoreError::Invalid(format!("invalid sync state '{s}'"))
                    })?,
                    None => prior_state,
                };
            } else {
                match prior_state {
                    SyncState::Deleted => {
                        return Err(StoreError::Invalid(format!(
                            "cannot update row '{row_id}': it is flagged deleted"
                        )));
                    }
                    SyncState::InConflict => {
                        return Err(StoreError::RowInConflict(row_id.to_string()));
                    }
                    SyncState::NewRow => update_state = SyncState::NewRow,
                    _ => update_state = SyncState::Changed,
                }

                let prior_owner = prior.text(ROW_OWNER);
                let prior_group_privileged = prior.text(GROUP_PRIVILEGED);
                if specifies_permissions {
                    tss.can_modify_permissions(
                        &user.active_user,
                        roles_slice,
                        prior_group_privileged.as_deref(),
                        prior_owner.as_deref(),
                    )?;
                }
                tss.allow_row_change(
                    &user.active_user,
                    roles_slice,
                    update_state,
                    prior.text(DEFAULT_ACCESS).as_deref(),
                    prior_owner.as_deref(),
                    prior.text(GROUP_MODIFY).as_deref(),
                    prior_group_privileged.as_deref(),
                    RowChange::ChangeRow,
                )?;
                // local edits never adjust the sync bookkeeping directly
                cleaned.remove(CONFLICT_TYPE);
            }
            cleaned.insert(
                SYNC_STATE.to_string(),
                DataValue::Text(update_state.to_string()),
            );
            Self::fill_savepoint_defaults(&mut cleaned, user);

            let columns: Vec<(String, Value)> = cleaned
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect();
            run_update(conn, table_id, &columns, row_id)?;
        } else {
            if count_rows_with_id(conn, table_id, row_id)? > 0 {
                return Err(StoreError::DuplicateRow(row_id.to_string()));
            }

            if as_server_requested_change {
                update_state = match cleaned.get(SYNC_STATE).and_then(DataValue::as_text) {
                    Some(s) => s.parse::<SyncState>().map_err(|_| {
                        StoreError::Invalid(format!("invalid sync state '{s}'"))
                    })?,
                    None => SyncState::NewRow,
                };
            } else {
                update_state = SyncState::NewRow;
                let incoming_group_privileged = cleaned
                    .get(GROUP_PRIVILEGED)
                    .and_then(DataValue::as_text)
                    .map(str::to_owned);
                if specifies_permissions {
                    // a fresh row has no owner yet
                    tss.can_modify_permissions(
                        &user.active_user,
                        roles_slice,
                        incoming_group_privileged.as_deref(),
                        None,
                    )?;
                }
                tss.allow_row_change(
                    &user.active_user,
                    roles_slice,
                    update_state,
                    cleaned.get(DEFAULT_ACCESS).and_then(DataValue::as_text),
                    cleaned.get(ROW_OWNER).and_then(DataValue::as_text),
                    cleaned.get(GROUP_MODIFY).and_then(DataValue::as_text),
                    incoming_group_privileged.as_deref(),
                    RowChange::NewRow,
                )?;
                cleaned.remove(ROW_ETAG);
                cleaned.remove(CONFLICT_TYPE);
            }

            cleaned.insert(ID.to_string(), DataValue::Text(row_id.to_string()));
            cleaned.insert(
                SYNC_STATE.to_string(),
                DataValue::Text(update_state.to_string()),
            );
            Self::fill_insert_defaults(&mut cleaned, &tss, user);

            let columns: Vec<(String, Value)> = cleaned
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect();
            run_insert(conn, table_id, &columns)?;
        }
        Ok(())
    }

    fn is_absent(values: &RowValues, col: &str) -> bool {
        matches!(values.get(col), None | Some(DataValue::Null))
    }

    fn fill_savepoint_defaults(values: &mut RowValues, user: &UserContext) {
        if Self::is_absent(values, SAVEPOINT_TIMESTAMP) {
            values.insert(
                SAVEPOINT_TIMESTAMP.to_string(),
                DataValue::Text(savepoint_timestamp_now()),
            );
        }
        if Self::is_absent(values, SAVEPOINT_TYPE) {
            values.insert(
                SAVEPOINT_TYPE.to_string(),
                DataValue::Text(SavepointType::Complete.to_string()),
            );
        }
        if Self::is_absent(values, SAVEPOINT_CREATOR) {
            values.insert(
                SAVEPOINT_CREATOR.to_string(),
                DataValue::Text(user.active_user.clone()),
            );
        }
        if Self::is_absent(values, LOCALE) {
            if let Some(locale) = &user.locale {
                values.insert(LOCALE.to_string(), DataValue::Text(locale.clone()));
            }
        }
    }

    fn fill_insert_defaults(
        values: &mut RowValues,
        tss: &TableSecuritySettings,
        user: &UserContext,
    ) {
        if Self::is_absent(values, DEFAULT_ACCESS) {
            values.insert(
                DEFAULT_ACCESS.to_string(),
                DataValue::Text(tss.default_access_on_creation.to_string()),
            );
        }
        if Self::is_absent(values, ROW_OWNER) {
            values.insert(
                ROW_OWNER.to_string(),
                DataValue::Text(user.active_user.clone()),
            );
        }
        Self::fill_savepoint_defaults(values, user);
    }

    /// Delete a row: checkpoints first, then either a physical delete
    /// (rows never synced) or a `deleted` flag for the server to observe.
    pub fn delete_row_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        Self::delete_row_impl(db, table_id, row_id, user, false)
    }

    /// Physically delete all rows with this id, conflict rows included.
    pub fn privileged_delete_row_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        Self::delete_row_impl(db, table_id, row_id, user, true)
    }

    fn delete_row_impl(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
        privileged: bool,
    ) -> Result<(), StoreError> {
        let fully_removed = with_transaction(&db.conn, |conn| {
            let rows = get_stored_rows(conn, table_id, row_id)?;
            if rows.is_empty() {
                return Ok(true);
            }

            if privileged {
                conn.execute(
                    &format!("DELETE FROM \"{table_id}\" WHERE {ID} = ?"),
                    [row_id],
                )?;
                return Ok(true);
            }

            if rows
                .iter()
                .any(|r| matches!(r.sync_state(), Ok(SyncState::InConflict)))
            {
                return Err(StoreError::RowInConflict(row_id.to_string()));
            }

            let tss = TableSecuritySettings::get(conn, table_id)?;
            let roles = user.roles()?;
            let newest = rows.last().ok_or_else(|| {
                StoreError::Corruption(format!("row '{row_id}' vanished mid-delete"))
            })?;
            tss.allow_row_change(
                &user.active_user,
                roles.as_deref().map(Vec::as_slice),
                newest.sync_state()?,
                newest.text(DEFAULT_ACCESS).as_deref(),
                newest.text(ROW_OWNER).as_deref(),
                newest.text(GROUP_MODIFY).as_deref(),
                newest.text(GROUP_PRIVILEGED).as_deref(),
                RowChange::DeleteRow,
            )?;

            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {SAVEPOINT_TYPE} IS NULL"
                ),
                [row_id],
            )?;

            let remaining = get_stored_rows(conn, table_id, row_id)?;
            let newest = match remaining.last() {
                None => return Ok(true),
                Some(r) => r,
            };
            if newest.sync_state()? == SyncState::NewRow {
                // never reached the server; no tombstone needed
                conn.execute(
                    &format!("DELETE FROM \"{table_id}\" WHERE {ID} = ?"),
                    [row_id],
                )?;
                Ok(true)
            } else {
                conn.execute(
                    &format!(
                        "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {SAVEPOINT_TIMESTAMP} = ? \
                         WHERE {ID} = ?"
                    ),
                    rusqlite::params![
                        SyncState::Deleted.as_ref(),
                        savepoint_timestamp_now(),
                        row_id
                    ],
                )?;
                Ok(false)
            }
        })?;

        if fully_removed {
            db.attachments().delete_instance_attachments(table_id, row_id)?;
        }
        Ok(())
    }

    /// Insert a draft (checkpoint) row, copying unsupplied values from the
    /// most recent prior version. Returns the row id (generated if the
    /// caller did not supply one).
    pub fn insert_checkpoint_row_with_id(
        db: &Database,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: Option<&str>,
        user: &UserContext,
    ) -> Result<String, StoreError> {
        let row_id = match row_id {
            Some(id) => id.to_owned(),
            None => Uuid::new_v4().to_string(),
        };
        with_transaction(&db.conn, |conn| {
            Self::insert_checkpoint_tx(conn, ordered, values, &row_id, user)
        })?;
        Ok(row_id)
    }

    fn insert_checkpoint_tx(
        conn: &Connection,
        ordered: &OrderedColumns,
        values: &RowValues,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        let table_id = ordered.table_id.as_str();
        let mut cleaned = clean_up_values_map(ordered, values)?;

        // the draft machinery owns all sync bookkeeping
        for forbidden in [
            SAVEPOINT_TIMESTAMP,
            SAVEPOINT_TYPE,
            ROW_ETAG,
            SYNC_STATE,
            CONFLICT_TYPE,
        ] {
            if cleaned.contains_key(forbidden) {
                return Err(StoreError::Invalid(format!(
                    "checkpoint values may not set '{forbidden}'"
                )));
            }
        }

        let tss = TableSecuritySettings::get(conn, table_id)?;
        let roles = user.roles()?;
        let roles_slice = roles.as_deref().map(Vec::as_slice);

        let rows = get_stored_rows(conn, table_id, row_id)?;
        if rows
            .iter()
            .any(|r| matches!(r.sync_state(), Ok(SyncState::InConflict)))
        {
            return Err(StoreError::RowInConflict(row_id.to_string()));
        }

        if rows.is_empty() {
            // first checkpoint of a brand new row
            let incoming_group_privileged = cleaned
                .get(GROUP_PRIVILEGED)
                .and_then(DataValue::as_text)
                .map(str::to_owned);
            if PERMISSION_COLUMNS.iter().any(|c| cleaned.contains_key(*c)) {
                tss.can_modify_permissions(
                    &user.active_user,
                    roles_slice,
                    incoming_group_privileged.as_deref(),
                    None,
                )?;
            }
            tss.allow_row_change(
                &user.active_user,
                roles_slice,
                SyncState::NewRow,
                cleaned.get(DEFAULT_ACCESS).and_then(DataValue::as_text),
                cleaned.get(ROW_OWNER).and_then(DataValue::as_text),
                cleaned.get(GROUP_MODIFY).and_then(DataValue::as_text),
                incoming_group_privileged.as_deref(),
                RowChange::NewRow,
            )?;

            cleaned.insert(ID.to_string(), DataValue::Text(row_id.to_string()));
            cleaned.insert(
                SYNC_STATE.to_string(),
                DataValue::Text(SyncState::NewRow.to_string()),
            );
            Self::fill_insert_defaults(&mut cleaned, &tss, user);
        } else {
            // later checkpoints may not touch the permission columns
            for forbidden in PERMISSION_COLUMNS {
                if cleaned.contains_key(forbidden) {
                    return Err(StoreError::Invalid(format!(
                        "checkpoint values may not set '{forbidden}' on an existing row"
                    )));
                }
            }
            let prior = &rows[rows.len() - 1];
            let prior_state = prior.sync_state()?;
            let next_state = if prior_state == SyncState::NewRow {
                SyncState::NewRow
            } else {
                SyncState::Changed
            };
            tss.allow_row_change(
                &user.active_user,
                roles_slice,
                next_state,
                prior.text(DEFAULT_ACCESS).as_deref(),
                prior.text(ROW_OWNER).as_deref(),
                prior.text(GROUP_MODIFY).as_deref(),
                prior.text(GROUP_PRIVILEGED).as_deref(),
                RowChange::ChangeRow,
            )?;

            // copy everything not overridden from the prior version
            for (name, value) in &prior.cols {
                if !cleaned.contains_key(name) {
                    cleaned.insert(
                        name.clone(),
                        match value {
                            Value::Null => DataValue::Null,
                            Value::Integer(i) => DataValue::Integer(*i),
                            Value::Real(r) => DataValue::Real(*r),
                            Value::Text(t) => DataValue::Text(t.clone()),
                            Value::Blob(_) => DataValue::Null,
                        },
                    );
                }
            }
            cleaned.insert(
                SYNC_STATE.to_string(),
                DataValue::Text(next_state.to_string()),
            );
        }

        cleaned.insert(
            SAVEPOINT_TIMESTAMP.to_string(),
            DataValue::Text(savepoint_timestamp_now()),
        );
        cleaned.insert(SAVEPOINT_TYPE.to_string(), DataValue::Null);
        cleaned.insert(
            SAVEPOINT_CREATOR.to_string(),
            DataValue::Text(user.active_user.clone()),
        );

        let columns: Vec<(String, Value)> = cleaned
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect();
        run_insert(conn, table_id, &columns)
    }

    pub fn save_as_incomplete_most_recent_checkpoint(
        db: &Database,
        table_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        Self::collapse_checkpoints(db, table_id, row_id, SavepointType::Incomplete)
    }

    pub fn save_as_complete_most_recent_checkpoint(
        db: &Database,
        table_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        Self::collapse_checkpoints(db, table_id, row_id, SavepointType::Complete)
    }

    /// Stamp every version of the row with the savepoint type, then keep
    /// only the most recent one.
    fn collapse_checkpoints(
        db: &Database,
        table_id: &str,
        row_id: &str,
        savepoint_type: SavepointType,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            if count_rows_with_id(conn, table_id, row_id)? == 0 {
                return Err(StoreError::RowNotFound(row_id.to_string()));
            }
            conn.execute(
                &format!("UPDATE \"{table_id}\" SET {SAVEPOINT_TYPE} = ? WHERE {ID} = ?"),
                rusqlite::params![savepoint_type.as_ref(), row_id],
            )?;
            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {SAVEPOINT_TIMESTAMP} NOT IN \
                     (SELECT MAX({SAVEPOINT_TIMESTAMP}) FROM \"{table_id}\" WHERE {ID} = ?)"
                ),
                rusqlite::params![row_id, row_id],
            )?;
            Ok(())
        })
    }

    /// Discard every draft of the row. Removes attachments if nothing
    /// remains for the id.
    pub fn delete_all_checkpoint_rows_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        let fully_removed = with_transaction(&db.conn, |conn| {
            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {SAVEPOINT_TYPE} IS NULL"
                ),
                [row_id],
            )?;
            Ok(count_rows_with_id(conn, table_id, row_id)? == 0)
        })?;
        if fully_removed {
            db.attachments().delete_instance_attachments(table_id, row_id)?;
        }
        Ok(())
    }

    /// Discard only the most recent draft of the row.
    pub fn delete_last_checkpoint_row_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        let fully_removed = with_transaction(&db.conn, |conn| {
            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {SAVEPOINT_TYPE} IS NULL \
                     AND {SAVEPOINT_TIMESTAMP} IN \
                     (SELECT MAX({SAVEPOINT_TIMESTAMP}) FROM \"{table_id}\" \
                      WHERE {ID} = ? AND {SAVEPOINT_TYPE} IS NULL)"
                ),
                rusqlite::params![row_id, row_id],
            )?;
            Ok(count_rows_with_id(conn, table_id, row_id)? == 0)
        })?;
        if fully_removed {
            db.attachments().delete_instance_attachments(table_id, row_id)?;
        }
        Ok(())
    }

    /// All versions of a row visible to the caller, oldest savepoint first,
    /// with `_effective_access` computed per row.
    pub fn get_rows_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
    ) -> Result<crate::query::ResultSet, StoreError> {
        let where_clause = format!("{ID} = ?");
        let order = format!("{SAVEPOINT_TIMESTAMP} ASC");
        crate::query::Query::query(
            db,
            table_id,
            Some(&where_clause),
            &[DataValue::Text(row_id.to_string())],
            Some(&order),
            None,
            user,
        )
    }

    /// All versions of a row regardless of visibility. Sync engine only.
    pub fn privileged_get_rows_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
    ) -> Result<crate::query::ResultSet, StoreError> {
        let where_clause = format!("{ID} = ?");
        let order = format!("{SAVEPOINT_TIMESTAMP} ASC");
        crate::query::Query::privileged_query(
            db,
            table_id,
            Some(&where_clause),
            &[DataValue::Text(row_id.to_string())],
            Some(&order),
            None,
            user,
        )
    }

    /// The newest visible version of a row, or an empty result set.
    pub fn get_most_recent_row_with_id(
        db: &Database,
        table_id: &str,
        row_id: &str,
        user: &UserContext,
    ) -> Result<crate::query::ResultSet, StoreError> {
        let where_clause = format!("{ID} = ?");
        let order = format!("{SAVEPOINT_TIMESTAMP} DESC");
        crate::query::Query::query(
            db,
            table_id,
            Some(&where_clause),
            &[DataValue::Text(row_id.to_string())],
            Some(&order),
            Some(crate::query::QueryBounds::new(1, 0)),
            user,
        )
    }

    /// The sync state shared by every version of the row, or None when the
    /// id is unknown. Disagreement among non-conflict rows is corruption.
    pub fn get_sync_state(
        db: &Database,
        table_id: &str,
        row_id: &str,
    ) -> Result<Option<SyncState>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT {SYNC_STATE} FROM \"{table_id}\" WHERE {ID} = ?"
        );
        let mut stmt = db.conn.prepare(&sql)?;
        let rows = stmt.query_map([row_id], |row| row.get::<_, String>(0))?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        match states.len() {
            0 => Ok(None),
            1 => {
                let state = states[0].parse::<SyncState>().map_err(|_| {
                    StoreError::Corruption(format!(
                        "row '{row_id}' has invalid sync state '{}'",
                        states[0]
                    ))
                })?;
                Ok(Some(state))
            }
            _ => Err(StoreError::Corruption(format!(
                "row '{row_id}' has rows in disagreeing sync states"
            ))),
        }
    }

    /// Record the server's acknowledgement of a pushed row. Sync engine
    /// only.
    pub fn privileged_update_row_etag_and_sync_state(
        db: &Database,
        table_id: &str,
        row_id: &str,
        row_etag: Option<&str>,
        state: SyncState,
    ) -> Result<(), StoreError> {
        if !(state.is_synced_variant() || state == SyncState::Deleted) {
            return Err(StoreError::Invalid(format!(
                "cannot force row '{row_id}' into state '{state}'"
            )));
        }
        with_transaction(&db.conn, |conn| {
            let rows = get_stored_rows(conn, table_id, row_id)?;
            match rows.len() {
                0 => return Err(StoreError::RowNotFound(row_id.to_string())),
                1 => {}
                _ => {
                    if rows
                        .iter()
                        .any(|r| matches!(r.sync_state(), Ok(SyncState::InConflict)))
                    {
                        return Err(StoreError::RowInConflict(row_id.to_string()));
                    }
                    return Err(StoreError::RowHasCheckpoints(row_id.to_string()));
                }
            }
            debug!("row '{row_id}' acknowledged as {state}");
            conn.execute(
                &format!(
                    "UPDATE \"{table_id}\" SET {ROW_ETAG} = ?, {SYNC_STATE} = ? WHERE {ID} = ?"
                ),
                rusqlite::params![row_etag, state.as_ref(), row_id],
            )?;
            Ok(())
        })
    }
}
