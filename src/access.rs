use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;
use rusqlite::Connection;

use crate::error::StoreError;
use crate::kvs::{
    KeyValueStore, ASPECT_SECURITY, KEY_DEFAULT_ACCESS_ON_CREATION, KEY_LOCKED,
    KEY_UNVERIFIED_USER_CAN_CREATE, PARTITION_TABLE,
};
use crate::rows::{
    Access, SyncState, DEFAULT_ACCESS, EFFECTIVE_ACCESS, GROUP_MODIFY, GROUP_PRIVILEGED,
    GROUP_READ_ONLY, ROW_OWNER, SYNC_STATE,
};

pub const ROLE_SUPER_USER: &str = "ROLE_SUPER_USER_TABLES";
pub const ROLE_ADMINISTRATOR: &str = "ROLE_ADMINISTER_TABLES";
pub const ROLE_USER: &str = "ROLE_USER";

/// Role list granted to the sync engine and other internal callers.
pub const ADMIN_ROLES_LIST: &str =
    "[\"ROLE_SUPER_USER_TABLES\",\"ROLE_ADMINISTER_TABLES\",\"ROLE_USER\"]";

static ADMIN_ROLES_ARRAY: Lazy<Arc<Vec<String>>> = Lazy::new(|| {
    Arc::new(
        serde_json::from_str::<Vec<String>>(ADMIN_ROLES_LIST)
            .unwrap_or_else(|_| unreachable!("constant role list is valid JSON")),
    )
});

const ROLES_CACHE_CAPACITY: usize = 8;

/// Parsed role lists, keyed by the raw JSON string. Most callers reuse one
/// or two role strings for the life of the process.
static ROLES_CACHE: Lazy<Mutex<Vec<(String, Arc<Vec<String>>)>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Parse a JSON role-list string. `None`/empty means unverified user.
pub fn get_roles_array(roles_list: Option<&str>) -> Result<Option<Arc<Vec<String>>>, StoreError> {
    let roles_list = match roles_list {
        None | Some("") => return Ok(None),
        Some(s) => s,
    };
    if roles_list == ADMIN_ROLES_LIST {
        return Ok(Some(ADMIN_ROLES_ARRAY.clone()));
    }

    if let Ok(mut cache) = ROLES_CACHE.lock() {
        if let Some(pos) = cache.iter().position(|(raw, _)| raw == roles_list) {
            let hit = cache.remove(pos);
            let roles = hit.1.clone();
            cache.push(hit); // most recently used last
            return Ok(Some(roles));
        }
    }

    let parsed: Vec<String> = serde_json::from_str(roles_list)
        .map_err(|e| StoreError::Invalid(format!("rolesList is not a JSON string array: {e}")))?;
    let roles = Arc::new(parsed);

    if let Ok(mut cache) = ROLES_CACHE.lock() {
        if cache.len() >= ROLES_CACHE_CAPACITY {
            cache.remove(0);
        }
        cache.push((roles_list.to_owned(), roles.clone()));
    }
    Ok(Some(roles))
}

/// Identity of the caller performing an operation.
#[derive(Clone, Debug)]
pub struct UserContext {
    pub active_user: String,
    pub roles_list: Option<String>,
    pub locale: Option<String>,
}

impl UserContext {
    pub fn new(active_user: &str, roles_list: Option<&str>, locale: Option<&str>) -> Self {
        UserContext {
            active_user: active_user.to_owned(),
            roles_list: roles_list.map(str::to_owned),
            locale: locale.map(str::to_owned),
        }
    }

    /// The internal identity used by the sync engine.
    pub fn internal(active_user: &str) -> Self {
        Self::new(active_user, Some(ADMIN_ROLES_LIST), None)
    }

    pub fn roles(&self) -> Result<Option<Arc<Vec<String>>>, StoreError> {
        get_roles_array(self.roles_list.as_deref())
    }
}

/// The proposed kind of row mutation, for policy decisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RowChange {
    NewRow,
    ChangeRow,
    DeleteRow,
}

/// Which effective-access CASE ladder applies to a result set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessColumnType {
    NoEffectiveAccessColumn,
    LockedEffectiveAccessColumn,
    UnlockedEffectiveAccessColumn,
}

/// A user's standing against one table: resolved roles, table lock state,
/// and whether row creation is permitted.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub access_column_type: AccessColumnType,
    pub can_create_row: bool,
    pub active_user: String,
    roles: Option<Arc<Vec<String>>>,
}

impl AccessContext {
    pub fn is_unverified_user(&self) -> bool {
        self.roles.is_none()
    }

    pub fn is_privileged_user(&self) -> bool {
        self.has_role(ROLE_SUPER_USER) || self.has_role(ROLE_ADMINISTRATOR)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles
            .as_ref()
            .map(|r| r.iter().any(|have| have == role))
            .unwrap_or(false)
    }

    /// Group memberships are conveyed within the role list; every entry is
    /// a candidate match for the per-row group columns.
    pub fn groups(&self) -> &[String] {
        self.roles.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The same user, elevated to internal privileges.
    pub fn copy_as_privileged_user(&self) -> AccessContext {
        AccessContext {
            access_column_type: self.access_column_type,
            can_create_row: true,
            active_user: self.active_user.clone(),
            roles: Some(ADMIN_ROLES_ARRAY.clone()),
        }
    }
}

/// Resolve the caller's permissions against a table (or against no table,
/// for catalog-level queries).
pub fn get_access_context(
    conn: &Connection,
    table_id: Option<&str>,
    user: &UserContext,
) -> Result<AccessContext, StoreError> {
    let roles = user.roles()?;

    let table_id = match table_id {
        None => {
            return Ok(AccessContext {
                access_column_type: AccessColumnType::NoEffectiveAccessColumn,
                can_create_row: false,
                active_user: user.active_user.clone(),
                roles,
            });
        }
        Some(t) if t.trim().is_empty() => {
            return Err(StoreError::Invalid(
                "tableId can be absent but cannot be blank".to_string(),
            ));
        }
        Some(t) => t,
    };

    let tss = TableSecuritySettings::get(conn, table_id)?;
    let access_column_type = if tss.is_locked {
        AccessColumnType::LockedEffectiveAccessColumn
    } else {
        AccessColumnType::UnlockedEffectiveAccessColumn
    };

    let can_create_row = if tss.is_locked {
        // only super-user or administrator can create rows in locked tables
        roles
            .as_ref()
            .map(|r| {
                r.iter()
                    .any(|role| role == ROLE_SUPER_USER || role == ROLE_ADMINISTRATOR)
            })
            .unwrap_or(false)
    } else if roles.is_none() {
        tss.can_unverified_user_create_row
    } else {
        true
    };

    Ok(AccessContext {
        access_column_type,
        can_create_row,
        active_user: user.active_user.clone(),
        roles,
    })
}

fn is_privileged(roles: &[String]) -> bool {
    roles
        .iter()
        .any(|r| r == ROLE_SUPER_USER || r == ROLE_ADMINISTRATOR)
}

fn contains_opt(roles: &[String], group: Option<&str>) -> bool {
    group
        .map(|g| roles.iter().any(|r| r == g))
        .unwrap_or(false)
}

/// Per-table security flags, read from the KVS security aspect.
#[derive(Clone, Debug)]
pub struct TableSecuritySettings {
    pub table_id: String,
    pub is_locked: bool,
    pub can_unverified_user_create_row: bool,
    pub default_access_on_creation: Access,
}

impl TableSecuritySettings {
    pub fn get(conn: &Connection, table_id: &str) -> Result<Self, StoreError> {
        let (entries, _rev) = KeyValueStore::get_entries(
            conn,
            table_id,
            Some(PARTITION_TABLE),
            Some(ASPECT_SECURITY),
            None,
        )?;

        let mut is_locked = false;
        let mut can_unverified_user_create_row = true;
        let mut default_access_on_creation = Access::Full;
        for entry in entries {
            let value = match entry.value.as_deref() {
                Some(v) => v,
                None => continue,
            };
            match entry.key.as_str() {
                KEY_LOCKED => is_locked = matches!(value, "true" | "1"),
                KEY_UNVERIFIED_USER_CAN_CREATE => {
                    can_unverified_user_create_row = matches!(value, "true" | "1")
                }
                KEY_DEFAULT_ACCESS_ON_CREATION => {
                    default_access_on_creation = value.parse::<Access>().map_err(|_| {
                        StoreError::Invalid(format!(
                            "defaultAccessOnCreation '{value}' is not an access level"
                        ))
                    })?
                }
                other => debug!("ignoring security key '{other}' for table '{table_id}'"),
            }
        }

        Ok(TableSecuritySettings {
            table_id: table_id.to_owned(),
            is_locked,
            can_unverified_user_create_row,
            default_access_on_creation,
        })
    }

    /// Decide whether the active user may change the permission columns
    /// (default access, owner, group slots) given the prior row state.
    pub fn can_modify_permissions(
        &self,
        active_user: &str,
        roles: Option<&[String]>,
        prior_group_privileged: Option<&str>,
        prior_owner: Option<&str>,
    ) -> Result<(), StoreError> {
        let roles = match roles {
            None => {
                return Err(StoreError::AccessDenied(format!(
                    "unverified users cannot modify defaultAccess, rowOwner, or group \
                     permission fields in (any) table {}",
                    self.table_id
                )));
            }
            Some(r) => r,
        };

        if is_privileged(roles) || contains_opt(roles, prior_group_privileged) {
            return Ok(());
        }

        // in an unlocked table the (possibly default) owner may assign
        // permissions; in a new row the prior owner is the default owner
        if !self.is_locked && (prior_owner.is_none() || prior_owner == Some(active_user)) {
            return Ok(());
        }

        Err(StoreError::AccessDenied(format!(
            "user does not have the privileges (super-user or administrator or group_privileged \
             or (row_owner in unlocked table)) to modify defaultAccess, rowOwner, or group \
             permission fields in table {}",
            self.table_id
        )))
    }

    /// The row-change decision table. Pure: depends only on the arguments
    /// and this table's flags.
    #[allow(clippy::too_many_arguments)]
    pub fn allow_row_change(
        &self,
        active_user: &str,
        roles: Option<&[String]>,
        updated_sync_state: SyncState,
        prior_default_access: Option<&str>,
        prior_owner: Option<&str>,
        prior_group_modify: Option<&str>,
        prior_group_privileged: Option<&str>,
        row_change: RowChange,
    ) -> Result<(), StoreError> {
        match row_change {
            RowChange::NewRow => {
                if self.is_locked {
                    let roles = roles.ok_or_else(|| {
                        StoreError::AccessDenied(format!(
                            "unverified users cannot create a row in a locked table {}",
                            self.table_id
                        ))
                    })?;
                    if !(is_privileged(roles) || contains_opt(roles, prior_group_privileged)) {
                        return Err(StoreError::AccessDenied(format!(
                            "user does not have the privileges (super-user or administrator or \
                             group_privileged) to create a row in a locked table {}",
                            self.table_id
                        )));
                    }
                } else if roles.is_none() && !self.can_unverified_user_create_row {
                    return Err(StoreError::AccessDenied(format!(
                        "unverified users do not have the privileges to create a row in this \
                         unlocked table {}",
                        self.table_id
                    )));
                }
                Ok(())
            }
            RowChange::ChangeRow => {
                // rows still in new_row state remain editable by their creator
                if updated_sync_state == SyncState::NewRow {
                    return Ok(());
                }
                if self.is_locked {
                    let roles = match roles {
                        None => {
                            return Err(StoreError::AccessDenied(format!(
                                "unverified users cannot modify rows in a locked table {}",
                                self.table_id
                            )));
                        }
                        Some(r) => r,
                    };
                    if prior_owner == Some(active_user) {
                        return Ok(());
                    }
                    if !(is_privileged(roles) || contains_opt(roles, prior_group_privileged)) {
                        return Err(StoreError::AccessDenied(format!(
                            "user does not have the privileges (super-user or administrator or \
                             group_privileged) to modify rows in a locked table {}",
                            self.table_id
                        )));
                    }
                    Ok(())
                } else {
                    let group_auth = roles
                        .map(|r| {
                            contains_opt(r, prior_group_modify)
                                || contains_opt(r, prior_group_privileged)
                        })
                        .unwrap_or(false);
                    if group_auth {
                        return Ok(());
                    }
                    if matches!(prior_default_access, Some(a) if a == Access::Modify.as_ref() || a == Access::Full.as_ref())
                    {
                        return Ok(());
                    }
                    if prior_owner.is_some() && prior_owner == Some(active_user) {
                        return Ok(());
                    }
                    match roles {
                        Some(r) if is_privileged(r) => Ok(()),
                        _ => Err(StoreError::AccessDenied(format!(
                            "user does not have the privileges (super-user or administrator) to \
                             modify hidden or read-only rows in an unlocked table {}",
                            self.table_id
                        ))),
                    }
                }
            }
            RowChange::DeleteRow => {
                if updated_sync_state == SyncState::NewRow {
                    return Ok(());
                }
                if self.is_locked {
                    let roles = roles.ok_or_else(|| {
                        StoreError::AccessDenied(format!(
                            "unverified users cannot delete rows in a locked table {}",
                            self.table_id
                        ))
                    })?;
                    if !(is_privileged(roles) || contains_opt(roles, prior_group_privileged)) {
                        return Err(StoreError::AccessDenied(format!(
                            "user does not have the privileges (super-user or administrator or \
                             group_privileged) to delete rows in a locked table {}",
                            self.table_id
                        )));
                    }
                    Ok(())
                } else {
                    let group_auth = roles
                        .map(|r| contains_opt(r, prior_group_privileged))
                        .unwrap_or(false);
                    if group_auth {
                        return Ok(());
                    }
                    if prior_default_access == Some(Access::Full.as_ref()) {
                        return Ok(());
                    }
                    if prior_owner.is_some() && prior_owner == Some(active_user) {
                        return Ok(());
                    }
                    match roles {
                        Some(r) if is_privileged(r) => Ok(()),
                        _ => Err(StoreError::AccessDenied(format!(
                            "user does not have the privileges (super-user or administrator) to \
                             delete hidden or read-only rows in an unlocked table {}",
                            self.table_id
                        ))),
                    }
                }
            }
        }
    }
}

/// Append `, <CASE ...> as _effective_access` for the wrapped query, adding
/// bind parameters in the documented stable order.
pub(crate) fn build_access_rights(
    b: &mut String,
    wrapped_args: &mut Vec<String>,
    ctx: &AccessContext,
) {
    if ctx.access_column_type == AccessColumnType::NoEffectiveAccessColumn {
        return;
    }

    b.push_str(", ");
    if ctx.is_privileged_user() {
        b.push_str(&format!("'rwdp' as {EFFECTIVE_ACCESS}"));
    } else if ctx.is_unverified_user() {
        if ctx.access_column_type == AccessColumnType::UnlockedEffectiveAccessColumn {
            // unlocked tables have r, rw (modify) and rwd (full defaultAccess or new_row)
            b.push_str(&format!(
                "case when T.{SYNC_STATE} = '{new_row}' then 'rwd' \
                 when T.{DEFAULT_ACCESS} = '{full}' then 'rwd' \
                 when T.{DEFAULT_ACCESS} = '{modify}' then 'rw' \
                 else 'r' end as {EFFECTIVE_ACCESS}",
                new_row = SyncState::NewRow.as_ref(),
                full = Access::Full.as_ref(),
                modify = Access::Modify.as_ref(),
            ));
        } else {
            // locked tables have just rwd (new_row) and r options
            b.push_str(&format!(
                "case when T.{SYNC_STATE} = '{new_row}' then 'rwd' else 'r' end as {EFFECTIVE_ACCESS}",
                new_row = SyncState::NewRow.as_ref(),
            ));
        }
    } else if ctx.access_column_type == AccessColumnType::UnlockedEffectiveAccessColumn {
        b.push_str(&format!(
            "case when T.{SYNC_STATE} = '{new_row}' then 'rwdp' when T.{ROW_OWNER} = ? then 'rwdp'",
            new_row = SyncState::NewRow.as_ref(),
        ));
        wrapped_args.push(ctx.active_user.clone());

        for group in ctx.groups() {
            b.push_str(&format!(" when T.{GROUP_PRIVILEGED} = ? then 'rwdp'"));
            wrapped_args.push(group.clone());
        }

        b.push_str(&format!(
            " when T.{DEFAULT_ACCESS} = '{full}' then 'rwd' \
             when T.{DEFAULT_ACCESS} = '{modify}' then 'rw'",
            full = Access::Full.as_ref(),
            modify = Access::Modify.as_ref(),
        ));

        for group in ctx.groups() {
            b.push_str(&format!(" when T.{GROUP_MODIFY} = ? then 'rw'"));
            wrapped_args.push(group.clone());
        }

        b.push_str(&format!(" else 'r' end as {EFFECTIVE_ACCESS}"));
    } else {
        // locked tables: rwdp (new_row, group_privileged), rw (owner), r
        b.push_str(&format!(
            "case when T.{SYNC_STATE} = '{new_row}' then 'rwdp'",
            new_row = SyncState::NewRow.as_ref(),
        ));

        for group in ctx.groups() {
            b.push_str(&format!(" when T.{GROUP_PRIVILEGED} = ? then 'rwdp'"));
            wrapped_args.push(group.clone());
        }

        b.push_str(&format!(" when T.{ROW_OWNER} = ? then 'rw'"));
        wrapped_args.push(ctx.active_user.clone());

        b.push_str(&format!(" else 'r' end as {EFFECTIVE_ACCESS}"));
    }
}

/// Append the row-visibility predicate for non-privileged callers, adding
/// bind parameters in the documented stable order.
pub(crate) fn append_visibility_filter(
    b: &mut String,
    wrapped_args: &mut Vec<String>,
    ctx: &AccessContext,
) {
    b.push_str(&format!(
        " WHERE T.{DEFAULT_ACCESS} != '{hidden}' OR T.{SYNC_STATE} = '{new_row}'",
        hidden = Access::Hidden.as_ref(),
        new_row = SyncState::NewRow.as_ref(),
    ));
    if !ctx.is_unverified_user() && ctx.has_role(ROLE_USER) {
        // visible if activeUser matches the row owner
        b.push_str(&format!(" OR T.{ROW_OWNER} = ?"));
        wrapped_args.push(ctx.active_user.clone());
    }
    for group_column in [GROUP_READ_ONLY, GROUP_MODIFY, GROUP_PRIVILEGED] {
        for group in ctx.groups() {
            b.push_str(&format!(" OR T.{group_column} = ?"));
            wrapped_args.push(group.clone());
        }
    }
}
