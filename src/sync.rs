use log::debug;
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::access::{RowChange, TableSecuritySettings, UserContext};
use crate::columns::{ElementDataType, OrderedColumns};
use crate::database::{with_transaction, Database};
use crate::error::StoreError;
use crate::etags::SyncEtags;
use crate::rows::{
    self, get_stored_rows, savepoint_timestamp_now, value_to_opt_string, ConflictType, DataValue,
    RowValues, SavepointType, StoredRow, SyncState, CONFLICT_TYPE, DEFAULT_ACCESS, FORM_ID,
    GROUP_MODIFY, GROUP_PRIVILEGED, GROUP_READ_ONLY, ID, LOCALE, ROW_ETAG, ROW_OWNER,
    SAVEPOINT_CREATOR, SAVEPOINT_TIMESTAMP, SAVEPOINT_TYPE, SYNC_STATE,
};
use crate::schema::TABLE_DEFS_TABLE;

/// One row as received from the server during a pull.
#[derive(Clone, Debug)]
pub struct ServerRow {
    pub row_id: String,
    pub row_etag: Option<String>,
    pub deleted: bool,
    pub default_access: Option<String>,
    pub row_owner: Option<String>,
    pub group_read_only: Option<String>,
    pub group_modify: Option<String>,
    pub group_privileged: Option<String>,
    pub form_id: Option<String>,
    pub locale: Option<String>,
    pub savepoint_type: Option<String>,
    pub savepoint_timestamp: Option<String>,
    pub savepoint_creator: Option<String>,
    /// User column values, keyed by retained element key.
    pub values: RowValues,
}

impl ServerRow {
    fn permission_value(&self, col: &str) -> Option<&str> {
        match col {
            DEFAULT_ACCESS => self.default_access.as_deref(),
            ROW_OWNER => self.row_owner.as_deref(),
            GROUP_READ_ONLY => self.group_read_only.as_deref(),
            GROUP_MODIFY => self.group_modify.as_deref(),
            GROUP_PRIVILEGED => self.group_privileged.as_deref(),
            _ => None,
        }
    }

    /// Whether any attachment (rowpath) column carries a value.
    fn has_attachments(&self, ordered: &OrderedColumns) -> bool {
        ordered.rowpath_keys().iter().any(|key| {
            matches!(self.values.get(key), Some(DataValue::Text(t)) if !t.is_empty())
        })
    }

    /// Full column map for writing this row locally in the given state.
    fn to_row_values(&self, state: SyncState, conflict_type: Option<ConflictType>) -> RowValues {
        let mut out = self.values.clone();
        let opt = |v: &Option<String>| match v {
            Some(s) => DataValue::Text(s.clone()),
            None => DataValue::Null,
        };
        out.insert(ID.to_string(), DataValue::Text(self.row_id.clone()));
        out.insert(ROW_ETAG.to_string(), opt(&self.row_etag));
        out.insert(SYNC_STATE.to_string(), DataValue::Text(state.to_string()));
        out.insert(
            CONFLICT_TYPE.to_string(),
            match conflict_type {
                Some(ct) => DataValue::Integer(ct.to_int()),
                None => DataValue::Null,
            },
        );
        out.insert(DEFAULT_ACCESS.to_string(), opt(&self.default_access));
        out.insert(ROW_OWNER.to_string(), opt(&self.row_owner));
        out.insert(GROUP_READ_ONLY.to_string(), opt(&self.group_read_only));
        out.insert(GROUP_MODIFY.to_string(), opt(&self.group_modify));
        out.insert(GROUP_PRIVILEGED.to_string(), opt(&self.group_privileged));
        out.insert(FORM_ID.to_string(), opt(&self.form_id));
        out.insert(LOCALE.to_string(), opt(&self.locale));
        out.insert(
            SAVEPOINT_TYPE.to_string(),
            match &self.savepoint_type {
                Some(t) => DataValue::Text(t.clone()),
                None => DataValue::Text(SavepointType::Complete.to_string()),
            },
        );
        out.insert(
            SAVEPOINT_TIMESTAMP.to_string(),
            match &self.savepoint_timestamp {
                Some(t) => DataValue::Text(t.clone()),
                None => DataValue::Text(savepoint_timestamp_now()),
            },
        );
        out.insert(SAVEPOINT_CREATOR.to_string(), opt(&self.savepoint_creator));
        out
    }
}

/// What ingesting one server row did to the local store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Server row was new here and has been inserted.
    Inserted,
    /// Local row had no local edits (or they were moot); server version taken.
    TakenFromServer,
    /// Row removed locally (deleted on the server, nothing to keep).
    Deleted,
    /// Divergent edits: a conflict pair now awaits user resolution.
    InConflict,
    /// Nothing to do.
    NoChange,
}

/// Two textual values are the same for conflict purposes. Numbers tolerate
/// representation drift from a server round-trip: values within 128
/// representable doubles of each other count as equal. NaN never equals
/// anything, itself included, even when both sides spell it the same way.
pub(crate) fn identical_value(
    a: Option<&str>,
    b: Option<&str>,
    data_type: ElementDataType,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => {
            if data_type == ElementDataType::Number {
                if let (Ok(fx), Ok(fy)) = (x.parse::<f64>(), y.parse::<f64>()) {
                    return nearly_equal(fx, fy);
                }
            }
            x == y
        }
        _ => false,
    }
}

const MAX_REPRESENTABLE_STEPS: i128 = 128;

fn nearly_equal(a: f64, b: f64) -> bool {
    if a == b {
        // covers equal finite values, equal infinities, and 0.0 == -0.0
        return true;
    }
    if a.is_nan() || b.is_nan() || a.is_infinite() || b.is_infinite() {
        return false;
    }
    (monotone_bits(a) - monotone_bits(b)).abs() <= MAX_REPRESENTABLE_STEPS
}

/// Map a finite double onto an integer line where adjacent representable
/// values differ by one.
fn monotone_bits(f: f64) -> i128 {
    let bits = f.to_bits() as i64;
    let ordered = if bits < 0 { i64::MIN - bits } else { bits };
    ordered as i128
}

/// True when the local row and the server row agree on every user column.
fn user_columns_identical(ordered: &OrderedColumns, local: &StoredRow, server: &ServerRow) -> bool {
    for defn in ordered.retained() {
        let key = defn.element_key();
        let local_value = local.text(key);
        let server_value = server
            .values
            .get(key)
            .map(|v| value_to_opt_string(&v.to_value()))
            .unwrap_or(None);
        if !identical_value(
            local_value.as_deref(),
            server_value.as_deref(),
            defn.data_type,
        ) {
            return false;
        }
    }
    true
}

/// Whether any attachment column on the server row names a different file
/// than the local row holds. Absent server values change nothing.
fn server_rowpath_changed(
    ordered: &OrderedColumns,
    local: &StoredRow,
    server: &ServerRow,
) -> bool {
    ordered.rowpath_keys().iter().any(|key| {
        match server
            .values
            .get(key)
            .map(|v| value_to_opt_string(&v.to_value()))
        {
            Some(Some(fragment)) => local.text(key).as_deref() != Some(fragment.as_str()),
            _ => false,
        }
    })
}

/// Collapse whatever rows carry this id down to the server version.
fn apply_server_row(
    conn: &Connection,
    ordered: &OrderedColumns,
    server: &ServerRow,
) -> Result<SyncOutcome, StoreError> {
    let table_id = ordered.table_id.as_str();
    delete_all_rows_with_id(conn, table_id, &server.row_id)?;
    if server.deleted {
        return Ok(SyncOutcome::Deleted);
    }
    let state = if server.has_attachments(ordered) {
        SyncState::SyncedPendingFiles
    } else {
        SyncState::Synced
    };
    insert_row_values(conn, table_id, &server.to_row_values(state, None))?;
    Ok(SyncOutcome::TakenFromServer)
}

/// Remove a lingering server-side conflict row for this id, if any.
pub(crate) fn delete_server_conflict_row(
    conn: &Connection,
    table_id: &str,
    row_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {SYNC_STATE} = ? \
             AND {CONFLICT_TYPE} IN (?, ?)"
        ),
        rusqlite::params![
            row_id,
            SyncState::InConflict.as_ref(),
            ConflictType::ServerDeletedOld.to_int(),
            ConflictType::ServerUpdatedUpdated.to_int()
        ],
    )?;
    Ok(())
}

fn insert_row_values(
    conn: &Connection,
    table_id: &str,
    values: &RowValues,
) -> Result<(), StoreError> {
    let mut b = format!("INSERT INTO \"{table_id}\" (");
    let mut placeholders = String::new();
    let columns: Vec<(&String, Value)> =
        values.iter().map(|(k, v)| (k, v.to_value())).collect();
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

fn replace_row_values(
    conn: &Connection,
    table_id: &str,
    row_id: &str,
    values: &RowValues,
) -> Result<(), StoreError> {
    let mut b = format!("UPDATE \"{table_id}\" SET ");
    let columns: Vec<(&String, Value)> = values
        .iter()
        .filter(|(k, _)| k.as_str() != ID)
        .map(|(k, v)| (k, v.to_value()))
        .collect();
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

fn delete_all_rows_with_id(
    conn: &Connection,
    table_id: &str,
    row_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        &format!("DELETE FROM \"{table_id}\" WHERE {ID} = ?"),
        [row_id],
    )?;
    Ok(())
}

pub struct Sync;

impl Sync {
    /// Ingest one server row: apply it directly when the local row has no
    /// divergent edits, otherwise materialize a conflict pair for the user
    /// to resolve. Sync engine only.
    pub fn privileged_perhaps_place_row_into_conflict(
        db: &Database,
        ordered: &OrderedColumns,
        server: &ServerRow,
        user: &UserContext,
    ) -> Result<SyncOutcome, StoreError> {
        let table_id = ordered.table_id.as_str();
        let row_id = server.row_id.as_str();
        let outcome = with_transaction(&db.conn, |conn| {
            delete_server_conflict_row(conn, table_id, row_id)?;

            let local_rows = get_stored_rows(conn, table_id, row_id)?;
            if local_rows.iter().any(StoredRow::is_checkpoint) {
                return Err(StoreError::RowHasCheckpoints(row_id.to_string()));
            }

            let local = match local_rows.first() {
                None => {
                    if server.deleted {
                        return Ok(SyncOutcome::NoChange);
                    }
                    let state = if server.has_attachments(ordered) {
                        SyncState::SyncedPendingFiles
                    } else {
                        SyncState::Synced
                    };
                    insert_row_values(conn, table_id, &server.to_row_values(state, None))?;
                    return Ok(SyncOutcome::Inserted);
                }
                Some(row) => row,
            };

            // restore a pre-conflict local state before re-evaluating
            let local_state = match (local.sync_state()?, local.conflict_type()?) {
                (SyncState::InConflict, Some(ConflictType::LocalDeletedOld)) => SyncState::Deleted,
                (SyncState::InConflict, _) => SyncState::Changed,
                // the server can know an id the device also generated
                (SyncState::NewRow, _) => SyncState::Changed,
                (state, _) => state,
            };

            match local_state {
                SyncState::Synced | SyncState::SyncedPendingFiles => {
                    // no local edits: server wins unconditionally
                    if server.deleted {
                        delete_all_rows_with_id(conn, table_id, row_id)?;
                        return Ok(SyncOutcome::Deleted);
                    }
                    // a synced row re-enters the pending-files state only
                    // when the server actually names a different attachment
                    let state = if local_state == SyncState::SyncedPendingFiles
                        || server_rowpath_changed(ordered, local, server)
                    {
                        SyncState::SyncedPendingFiles
                    } else {
                        SyncState::Synced
                    };
                    replace_row_values(
                        conn,
                        table_id,
                        row_id,
                        &server.to_row_values(state, None),
                    )?;
                    Ok(SyncOutcome::TakenFromServer)
                }
                SyncState::Deleted if server.deleted => {
                    // both sides deleted: nothing left to argue about
                    delete_all_rows_with_id(conn, table_id, row_id)?;
                    Ok(SyncOutcome::Deleted)
                }
                SyncState::Deleted | SyncState::Changed => {
                    let local_conflict = if local_state == SyncState::Deleted {
                        ConflictType::LocalDeletedOld
                    } else {
                        ConflictType::LocalUpdatedUpdated
                    };
                    let server_conflict = if server.deleted {
                        ConflictType::ServerDeletedOld
                    } else {
                        ConflictType::ServerUpdatedUpdated
                    };
                    conn.execute(
                        &format!(
                            "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {CONFLICT_TYPE} = ? \
                             WHERE {ID} = ?"
                        ),
                        rusqlite::params![
                            SyncState::InConflict.as_ref(),
                            local_conflict.to_int(),
                            row_id
                        ],
                    )?;
                    insert_row_values(
                        conn,
                        table_id,
                        &server.to_row_values(SyncState::InConflict, Some(server_conflict)),
                    )?;

                    // if the incoming permissions forbid this user's local
                    // edit (or delete), it could never be pushed: server wins
                    let tss = TableSecuritySettings::get(conn, table_id)?;
                    let roles = user.roles()?;
                    let (updated_state, change) =
                        if local_conflict == ConflictType::LocalDeletedOld {
                            (SyncState::Deleted, RowChange::DeleteRow)
                        } else {
                            (SyncState::Changed, RowChange::ChangeRow)
                        };
                    let allowed = tss
                        .allow_row_change(
                            &user.active_user,
                            roles.as_deref().map(Vec::as_slice),
                            updated_state,
                            server.permission_value(DEFAULT_ACCESS),
                            server.permission_value(ROW_OWNER),
                            server.permission_value(GROUP_MODIFY),
                            server.permission_value(GROUP_PRIVILEGED),
                            change,
                        )
                        .is_ok();
                    if !allowed {
                        debug!(
                            "row '{row_id}': local edit not permitted under server \
                             permissions, taking server version"
                        );
                        return apply_server_row(conn, ordered, server);
                    }

                    // a user who may not alter permission fields cannot keep
                    // local values in them: reset them to the server's
                    let mut local_perms_match = rows::PERMISSION_COLUMNS
                        .iter()
                        .all(|col| local.text(col).as_deref() == server.permission_value(col));
                    if !local_perms_match {
                        let can_modify = tss
                            .can_modify_permissions(
                                &user.active_user,
                                roles.as_deref().map(Vec::as_slice),
                                server.permission_value(GROUP_PRIVILEGED),
                                server.permission_value(ROW_OWNER),
                            )
                            .is_ok();
                        if !can_modify {
                            conn.execute(
                                &format!(
                                    "UPDATE \"{table_id}\" SET {DEFAULT_ACCESS} = ?, \
                                     {ROW_OWNER} = ?, {GROUP_READ_ONLY} = ?, \
                                     {GROUP_MODIFY} = ?, {GROUP_PRIVILEGED} = ? \
                                     WHERE {ID} = ? AND {CONFLICT_TYPE} IN (?, ?)"
                                ),
                                rusqlite::params![
                                    server.permission_value(DEFAULT_ACCESS),
                                    server.permission_value(ROW_OWNER),
                                    server.permission_value(GROUP_READ_ONLY),
                                    server.permission_value(GROUP_MODIFY),
                                    server.permission_value(GROUP_PRIVILEGED),
                                    row_id,
                                    ConflictType::LocalDeletedOld.to_int(),
                                    ConflictType::LocalUpdatedUpdated.to_int()
                                ],
                            )?;
                            local_perms_match = true;
                        }
                    }

                    // a mix of delete and modify always needs the user; two
                    // modifies that agree on content collapse to the server
                    // version, adopting its etag and metadata
                    if local_conflict == ConflictType::LocalDeletedOld || server.deleted {
                        return Ok(SyncOutcome::InConflict);
                    }
                    if local_perms_match && user_columns_identical(ordered, local, server) {
                        return apply_server_row(conn, ordered, server);
                    }
                    Ok(SyncOutcome::InConflict)
                }
                other => Err(StoreError::Corruption(format!(
                    "row '{row_id}' in unexpected state '{other}' during sync"
                ))),
            }
        })?;

        if outcome == SyncOutcome::Deleted {
            db.attachments().delete_instance_attachments(table_id, row_id)?;
        }
        Ok(outcome)
    }

    /// Resolve a conflict by discarding local edits in favor of the server
    /// version.
    pub fn resolve_conflict_take_server_row(
        db: &Database,
        ordered: &OrderedColumns,
        row_id: &str,
    ) -> Result<(), StoreError> {
        let table_id = ordered.table_id.as_str();
        let server_deleted = with_transaction(&db.conn, |conn| {
            let (_, server) = Self::get_conflict_pair(conn, table_id, row_id)?;

            if server.conflict_type()? == Some(ConflictType::ServerDeletedOld) {
                delete_all_rows_with_id(conn, table_id, row_id)?;
                return Ok(true);
            }

            // keep only the server row, back in a synced state
            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {ID} = ? AND {CONFLICT_TYPE} IN (?, ?)"
                ),
                rusqlite::params![
                    row_id,
                    ConflictType::LocalDeletedOld.to_int(),
                    ConflictType::LocalUpdatedUpdated.to_int()
                ],
            )?;
            let state = if Self::stored_row_has_attachments(ordered, &server) {
                SyncState::SyncedPendingFiles
            } else {
                SyncState::Synced
            };
            conn.execute(
                &format!(
                    "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {CONFLICT_TYPE} = NULL \
                     WHERE {ID} = ?"
                ),
                rusqlite::params![state.as_ref(), row_id],
            )?;
            Ok(false)
        })?;
        if server_deleted {
            db.attachments().delete_instance_attachments(table_id, row_id)?;
        }
        Ok(())
    }

    /// Resolve a conflict by keeping the local edits (or local delete),
    /// adopting the server's etag and permission columns.
    pub fn resolve_conflict_take_local_row(
        db: &Database,
        ordered: &OrderedColumns,
        row_id: &str,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        Self::take_local(db, ordered, row_id, &RowValues::new(), user)
    }

    /// Resolve a conflict by keeping the local edits with further caller
    /// amendments layered on top. Not available when the local side of the
    /// conflict is a delete.
    pub fn resolve_conflict_take_local_row_plus_server_deltas(
        db: &Database,
        ordered: &OrderedColumns,
        row_id: &str,
        values: &RowValues,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        Self::take_local(db, ordered, row_id, values, user)
    }

    fn take_local(
        db: &Database,
        ordered: &OrderedColumns,
        row_id: &str,
        extra_values: &RowValues,
        user: &UserContext,
    ) -> Result<(), StoreError> {
        let table_id = ordered.table_id.as_str();
        with_transaction(&db.conn, |conn| {
            let (local, server) = Self::get_conflict_pair(conn, table_id, row_id)?;

            let local_was_delete =
                local.conflict_type()? == Some(ConflictType::LocalDeletedOld);
            if local_was_delete && !extra_values.is_empty() {
                return Err(StoreError::Invalid(format!(
                    "cannot amend row '{row_id}': the local side of the conflict is a delete"
                )));
            }

            delete_server_conflict_row(conn, table_id, row_id)?;

            let next_state = if local_was_delete {
                SyncState::Deleted
            } else {
                SyncState::Changed
            };
            let mut updates = rows::clean_up_values_map(ordered, extra_values)?;
            updates.insert(
                SYNC_STATE.to_string(),
                DataValue::Text(next_state.to_string()),
            );
            updates.insert(CONFLICT_TYPE.to_string(), DataValue::Null);
            // the push must carry the server's etag and permission columns
            updates.insert(
                ROW_ETAG.to_string(),
                match server.text(ROW_ETAG) {
                    Some(etag) => DataValue::Text(etag),
                    None => DataValue::Null,
                },
            );
            for col in rows::PERMISSION_COLUMNS {
                updates.insert(
                    col.to_string(),
                    match server.text(col) {
                        Some(v) => DataValue::Text(v),
                        None => DataValue::Null,
                    },
                );
            }
            if !extra_values.is_empty() {
                updates.insert(
                    SAVEPOINT_TIMESTAMP.to_string(),
                    DataValue::Text(savepoint_timestamp_now()),
                );
                updates.insert(
                    SAVEPOINT_CREATOR.to_string(),
                    DataValue::Text(user.active_user.clone()),
                );
            }
            replace_row_values(conn, table_id, row_id, &updates)
        })
    }

    /// Resolve a conflict by deleting the row on both sides: the pair is
    /// removed locally and the delete will not be pushed (the server side
    /// already knows its own version).
    pub fn resolve_conflict_with_delete_row(
        db: &Database,
        ordered: &OrderedColumns,
        row_id: &str,
    ) -> Result<(), StoreError> {
        let table_id = ordered.table_id.as_str();
        with_transaction(&db.conn, |conn| {
            let _ = Self::get_conflict_pair(conn, table_id, row_id)?;
            delete_all_rows_with_id(conn, table_id, row_id)
        })?;
        db.attachments().delete_instance_attachments(table_id, row_id)?;
        Ok(())
    }

    fn stored_row_has_attachments(ordered: &OrderedColumns, row: &StoredRow) -> bool {
        ordered
            .rowpath_keys()
            .iter()
            .any(|key| matches!(row.text(key), Some(t) if !t.is_empty()))
    }

    /// Fetch the (local, server) rows of a conflict pair.
    fn get_conflict_pair(
        conn: &Connection,
        table_id: &str,
        row_id: &str,
    ) -> Result<(StoredRow, StoredRow), StoreError> {
        let rows = get_stored_rows(conn, table_id, row_id)?;
        let mut local = None;
        let mut server = None;
        for row in rows {
            if row.sync_state()? != SyncState::InConflict {
                return Err(StoreError::Invalid(format!(
                    "row '{row_id}' is not in conflict"
                )));
            }
            match row.conflict_type()? {
                Some(ct) if ct.is_server_side() => server = Some(row),
                Some(_) => local = Some(row),
                None => {
                    return Err(StoreError::Corruption(format!(
                        "conflicted row '{row_id}' lacks a conflict type"
                    )));
                }
            }
        }
        match (local, server) {
            (Some(l), Some(s)) => Ok((l, s)),
            _ => Err(StoreError::Invalid(format!(
                "row '{row_id}' is not in conflict"
            ))),
        }
    }

    /// The server reports a different table schema: every local row must be
    /// re-pushed against the new schema. Conflicts collapse back to their
    /// local side, synced rows revert to new_row, and all cached etags for
    /// the table are dropped.
    pub fn privileged_server_table_schema_etag_changed(
        db: &Database,
        table_id: &str,
        new_schema_etag: Option<&str>,
    ) -> Result<(), StoreError> {
        with_transaction(&db.conn, |conn| {
            conn.execute(
                &format!(
                    "DELETE FROM \"{table_id}\" WHERE {SYNC_STATE} = ? \
                     AND {CONFLICT_TYPE} IN (?, ?)"
                ),
                rusqlite::params![
                    SyncState::InConflict.as_ref(),
                    ConflictType::ServerDeletedOld.to_int(),
                    ConflictType::ServerUpdatedUpdated.to_int()
                ],
            )?;
            conn.execute(
                &format!(
                    "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {CONFLICT_TYPE} = NULL \
                     WHERE {SYNC_STATE} = ? AND {CONFLICT_TYPE} = ?"
                ),
                rusqlite::params![
                    SyncState::Deleted.as_ref(),
                    SyncState::InConflict.as_ref(),
                    ConflictType::LocalDeletedOld.to_int()
                ],
            )?;
            conn.execute(
                &format!(
                    "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {CONFLICT_TYPE} = NULL \
                     WHERE {SYNC_STATE} = ?"
                ),
                rusqlite::params![
                    SyncState::Changed.as_ref(),
                    SyncState::InConflict.as_ref()
                ],
            )?;
            conn.execute(
                &format!(
                    "UPDATE \"{table_id}\" SET {SYNC_STATE} = ?, {ROW_ETAG} = NULL \
                     WHERE {SYNC_STATE} IN (?, ?)"
                ),
                rusqlite::params![
                    SyncState::NewRow.as_ref(),
                    SyncState::Synced.as_ref(),
                    SyncState::SyncedPendingFiles.as_ref()
                ],
            )?;
            conn.execute(
                &format!(
                    "UPDATE {TABLE_DEFS_TABLE} SET _schema_etag = ?, _last_data_etag = NULL \
                     WHERE _table_id = ?"
                ),
                rusqlite::params![new_schema_etag, table_id],
            )?;
            SyncEtags::delete_all_for_table(conn, table_id)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::Column;
    use crate::rows::Rows;
    use crate::tables::Tables;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn setup() -> (Database, OrderedColumns) {
        let db = Database::open_in_memory().unwrap();
        let ordered = Tables::create_or_open_table_with_columns(
            &db,
            "survey",
            vec![
                Column::new("name", "name", "string", None),
                Column::new("score", "score", "number", None),
                Column::new("photo", "photo", "rowpath", None),
            ],
        )
        .unwrap();
        (db, ordered)
    }

    fn user() -> UserContext {
        UserContext::new("user1", Some(r#"["ROLE_USER"]"#), None)
    }

    fn server_row(row_id: &str, etag: &str, name: &str) -> ServerRow {
        let mut values = RowValues::new();
        values.insert("name".to_string(), DataValue::Text(name.to_string()));
        ServerRow {
            row_id: row_id.to_string(),
            row_etag: Some(etag.to_string()),
            deleted: false,
            default_access: Some("FULL".to_string()),
            row_owner: Some("user1".to_string()),
            group_read_only: None,
            group_modify: None,
            group_privileged: None,
            form_id: None,
            locale: None,
            savepoint_type: Some("COMPLETE".to_string()),
            savepoint_timestamp: Some("2025-03-01T00:00:00.000000000".to_string()),
            savepoint_creator: Some("user1".to_string()),
            values,
        }
    }

    fn insert_local_changed(db: &Database, ordered: &OrderedColumns, row_id: &str, name: &str) {
        let mut values = RowValues::new();
        values.insert("name".to_string(), DataValue::Text(name.to_string()));
        Rows::insert_row_with_id(db, ordered, &values, row_id, &user()).unwrap();
        Rows::privileged_update_row_etag_and_sync_state(
            db,
            "survey",
            row_id,
            Some("etag-0"),
            SyncState::Synced,
        )
        .unwrap();
        let mut edit = RowValues::new();
        edit.insert("name".to_string(), DataValue::Text(format!("{name} local")));
        Rows::update_row_with_id(db, ordered, &edit, row_id, &user()).unwrap();
    }

    #[test]
    fn unknown_server_row_is_inserted_synced() {
        let (db, ordered) = setup();
        let outcome = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada"),
            &user(),
        )
        .unwrap();
        assert_eq!(outcome, SyncOutcome::Inserted);
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::Synced)
        );
    }

    #[test]
    fn server_row_with_attachment_lands_pending_files() {
        let (db, ordered) = setup();
        let mut server = server_row("r1", "etag-1", "Ada");
        server.values.insert(
            "photo".to_string(),
            DataValue::Text("photo.jpg".to_string()),
        );
        Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user()).unwrap();
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::SyncedPendingFiles)
        );
    }

    #[test]
    fn clean_local_row_takes_server_update() {
        let (db, ordered) = setup();
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada"),
            &user(),
        )
        .unwrap();
        let outcome = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-2", "Grace"),
            &user(),
        )
        .unwrap();
        assert_eq!(outcome, SyncOutcome::TakenFromServer);
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("name").as_deref(), Some("Grace"));
        assert_eq!(rows[0].text(ROW_ETAG).as_deref(), Some("etag-2"));
    }

    #[test]
    fn divergent_edits_produce_conflict_pair() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");

        let outcome = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();
        assert_eq!(outcome, SyncOutcome::InConflict);

        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 2);
        let mut conflict_types: Vec<i64> = rows
            .iter()
            .map(|r| r.conflict_type().unwrap().unwrap().to_int())
            .collect();
        conflict_types.sort_unstable();
        assert_eq!(conflict_types, vec![1, 3]);
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::InConflict)
        );
    }

    #[test]
    fn identical_content_adopts_server_etag_without_conflict() {
        let (db, ordered) = setup();
        // locally edited to the exact value the server now reports
        insert_local_changed(&db, &ordered, "r1", "Ada");
        let outcome = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada local"),
            &user(),
        )
        .unwrap();
        assert_eq!(outcome, SyncOutcome::TakenFromServer);
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_state().unwrap(), SyncState::Synced);
        assert_eq!(rows[0].text(ROW_ETAG).as_deref(), Some("etag-1"));
    }

    #[test]
    fn both_sides_deleted_removes_row() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Rows::delete_row_with_id(&db, "survey", "r1", &user()).unwrap();
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::Deleted)
        );

        let mut server = server_row("r1", "etag-1", "Ada");
        server.deleted = true;
        let outcome =
            Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user())
                .unwrap();
        assert_eq!(outcome, SyncOutcome::Deleted);
        assert_eq!(Rows::get_sync_state(&db, "survey", "r1").unwrap(), None);
    }

    #[test]
    fn local_delete_against_server_update_conflicts() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Rows::delete_row_with_id(&db, "survey", "r1", &user()).unwrap();

        let outcome = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();
        assert_eq!(outcome, SyncOutcome::InConflict);
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        let mut conflict_types: Vec<i64> = rows
            .iter()
            .map(|r| r.conflict_type().unwrap().unwrap().to_int())
            .collect();
        conflict_types.sort_unstable();
        assert_eq!(conflict_types, vec![0, 3]);
    }

    #[test]
    fn forbidden_local_delete_takes_server_version() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Rows::delete_row_with_id(&db, "survey", "r1", &user()).unwrap();

        // the server moved the row out of this user's reach, so the local
        // delete could never be pushed
        let mut server = server_row("r1", "etag-1", "Ada server");
        server.default_access = Some("READ_ONLY".to_string());
        server.row_owner = Some("someone_else".to_string());
        let outcome =
            Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user())
                .unwrap();
        assert_eq!(outcome, SyncOutcome::TakenFromServer);

        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_state().unwrap(), SyncState::Synced);
        assert_eq!(rows[0].text("name").as_deref(), Some("Ada server"));
    }

    #[test]
    fn conflict_pair_adopts_server_permission_fields() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");

        let mut server = server_row("r1", "etag-1", "Ada server");
        server.default_access = Some("MODIFY".to_string());
        server.row_owner = Some("someone_else".to_string());
        let outcome =
            Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user())
                .unwrap();
        assert_eq!(outcome, SyncOutcome::InConflict);

        // user1 may not alter permission fields, so the local side of the
        // pair carries the server's values too
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.text(DEFAULT_ACCESS).as_deref(), Some("MODIFY"));
            assert_eq!(row.text(ROW_OWNER).as_deref(), Some("someone_else"));
        }
    }

    #[test]
    fn metadata_only_conflict_resolves_to_server() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");

        // same user content; only the permission fields moved on the server
        let mut server = server_row("r1", "etag-1", "Ada local");
        server.default_access = Some("MODIFY".to_string());
        server.row_owner = Some("someone_else".to_string());
        let outcome =
            Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user())
                .unwrap();
        assert_eq!(outcome, SyncOutcome::TakenFromServer);

        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_state().unwrap(), SyncState::Synced);
        assert_eq!(rows[0].text(ROW_OWNER).as_deref(), Some("someone_else"));
        assert_eq!(rows[0].text(ROW_ETAG).as_deref(), Some("etag-1"));
    }

    #[test]
    fn unchanged_attachment_keeps_row_synced() {
        let (db, ordered) = setup();
        let mut server = server_row("r1", "etag-1", "Ada");
        server
            .values
            .insert("photo".to_string(), DataValue::Text("photo.jpg".to_string()));
        Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user()).unwrap();
        // the attachment has since been pulled down
        Rows::privileged_update_row_etag_and_sync_state(
            &db,
            "survey",
            "r1",
            Some("etag-1"),
            SyncState::Synced,
        )
        .unwrap();

        // a delta touching only a data column leaves the row synced
        let mut server = server_row("r1", "etag-2", "Grace");
        server
            .values
            .insert("photo".to_string(), DataValue::Text("photo.jpg".to_string()));
        let outcome =
            Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user())
                .unwrap();
        assert_eq!(outcome, SyncOutcome::TakenFromServer);
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::Synced)
        );

        // a different attachment re-enters the pending-files state
        let mut server = server_row("r1", "etag-3", "Grace");
        server
            .values
            .insert("photo".to_string(), DataValue::Text("retake.jpg".to_string()));
        Sync::privileged_perhaps_place_row_into_conflict(&db, &ordered, &server, &user()).unwrap();
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::SyncedPendingFiles)
        );
    }

    #[test]
    fn checkpoints_block_sync_ingestion() {
        let (db, ordered) = setup();
        let mut values = RowValues::new();
        values.insert("name".to_string(), DataValue::Text("draft".to_string()));
        let row_id =
            Rows::insert_checkpoint_row_with_id(&db, &ordered, &values, None, &user()).unwrap();

        let err = Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row(&row_id, "etag-1", "Ada"),
            &user(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::RowHasCheckpoints(_)));
    }

    #[test]
    fn resolve_take_server() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();

        Sync::resolve_conflict_take_server_row(&db, &ordered, "r1").unwrap();
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_state().unwrap(), SyncState::Synced);
        assert_eq!(rows[0].text("name").as_deref(), Some("Ada server"));
        assert_eq!(rows[0].text(ROW_ETAG).as_deref(), Some("etag-1"));
    }

    #[test]
    fn resolve_take_local_keeps_edits_and_adopts_etag() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();

        Sync::resolve_conflict_take_local_row(&db, &ordered, "r1", &user()).unwrap();
        let rows = get_stored_rows(&db.conn, "survey", "r1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_state().unwrap(), SyncState::Changed);
        assert_eq!(rows[0].text("name").as_deref(), Some("Ada local"));
        // etag of the version we diverged from, so the push can be matched
        assert_eq!(rows[0].text(ROW_ETAG).as_deref(), Some("etag-1"));
    }

    #[test]
    fn resolve_take_local_with_deltas_rejected_for_local_delete() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Rows::delete_row_with_id(&db, "survey", "r1", &user()).unwrap();
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();

        let mut deltas = RowValues::new();
        deltas.insert("name".to_string(), DataValue::Text("merged".to_string()));
        let err = Sync::resolve_conflict_take_local_row_plus_server_deltas(
            &db, &ordered, "r1", &deltas, &user(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        // but a plain take-local continues the delete
        Sync::resolve_conflict_take_local_row(&db, &ordered, "r1", &user()).unwrap();
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::Deleted)
        );
    }

    #[test]
    fn resolve_with_delete_removes_pair() {
        let (db, ordered) = setup();
        insert_local_changed(&db, &ordered, "r1", "Ada");
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada server"),
            &user(),
        )
        .unwrap();

        Sync::resolve_conflict_with_delete_row(&db, &ordered, "r1").unwrap();
        assert_eq!(Rows::get_sync_state(&db, "survey", "r1").unwrap(), None);
    }

    #[test]
    fn schema_etag_change_resets_sync_progress() {
        let (db, ordered) = setup();
        // one synced row, one conflicted row
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r1", "etag-1", "Ada"),
            &user(),
        )
        .unwrap();
        insert_local_changed(&db, &ordered, "r2", "Grace");
        Sync::privileged_perhaps_place_row_into_conflict(
            &db,
            &ordered,
            &server_row("r2", "etag-2", "Grace server"),
            &user(),
        )
        .unwrap();

        Sync::privileged_server_table_schema_etag_changed(&db, "survey", Some("schema-2")).unwrap();

        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r1").unwrap(),
            Some(SyncState::NewRow)
        );
        assert_eq!(
            Rows::get_sync_state(&db, "survey", "r2").unwrap(),
            Some(SyncState::Changed)
        );
        let rows = get_stored_rows(&db.conn, "survey", "r2").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("name").as_deref(), Some("Grace local"));

        let entry = Tables::get_table_definition_entry(&db, "survey")
            .unwrap()
            .unwrap();
        assert_eq!(entry.schema_etag.as_deref(), Some("schema-2"));
        assert_eq!(entry.last_data_etag, None);
    }

    #[test]
    fn identical_value_tolerates_number_drift() {
        assert!(identical_value(None, None, ElementDataType::String));
        assert!(!identical_value(Some("a"), None, ElementDataType::String));
        assert!(identical_value(Some("a"), Some("a"), ElementDataType::String));
        assert!(!identical_value(Some("a"), Some("b"), ElementDataType::String));

        // textual difference but numerically adjacent
        let a = 0.1f64;
        let b = f64::from_bits(a.to_bits() + 3);
        assert!(identical_value(
            Some(&format!("{a:.20}")),
            Some(&format!("{b:.20}")),
            ElementDataType::Number
        ));
        assert!(!identical_value(
            Some("0.1"),
            Some("0.2"),
            ElementDataType::Number
        ));
        assert!(!identical_value(
            Some("NaN"),
            Some("NaN"),
            ElementDataType::Number
        ));
        assert!(identical_value(
            Some("inf"),
            Some("inf"),
            ElementDataType::Number
        ));
    }

    proptest! {
        #[test]
        fn nearly_equal_is_reflexive_and_symmetric(a in any::<f64>(), b in any::<f64>()) {
            if !a.is_nan() {
                prop_assert!(nearly_equal(a, a));
            }
            prop_assert_eq!(nearly_equal(a, b), nearly_equal(b, a));
        }

        #[test]
        fn nearly_equal_respects_step_bound(a in any::<f64>().prop_filter("finite", |f| f.is_finite()), steps in 0i64..=128) {
            let mut b = a;
            for _ in 0..steps {
                b = if b >= 0.0 {
                    f64::from_bits(b.to_bits() + 1)
                } else {
                    f64::from_bits(b.to_bits() - 1)
                };
            }
            if b.is_finite() {
                prop_assert!(nearly_equal(a, b));
            }
        }
    }
}
