use rusqlite::types::Value;

use crate::access::{self, get_access_context, AccessContext, UserContext};
use crate::database::Database;
use crate::error::StoreError;
use crate::rows::{
    value_to_opt_string, DataValue, DEFAULT_ACCESS, GROUP_MODIFY, GROUP_PRIVILEGED,
    GROUP_READ_ONLY, ROW_OWNER, SYNC_STATE,
};

/// Paging window for a query. A non-positive limit means unbounded; a
/// negative offset is treated as zero.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryBounds {
    pub limit: i64,
    pub offset: i64,
}

impl QueryBounds {
    pub fn new(limit: i64, offset: i64) -> Self {
        QueryBounds { limit, offset }
    }

    fn sql_suffix(&self) -> String {
        let offset = self.offset.max(0);
        if self.limit > 0 {
            format!(" LIMIT {} OFFSET {}", self.limit, offset)
        } else if offset > 0 {
            // SQLite requires a LIMIT clause to carry an OFFSET
            format!(" LIMIT -1 OFFSET {offset}")
        } else {
            String::new()
        }
    }
}

/// A fully materialized query result. Values are carried as their display
/// strings; NULL stays `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `column` in row `row`, or None for NULL or unknown names.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// The columns a result set must expose for the access wrapper to apply.
const REQUIRED_WRAP_COLUMNS: [&str; 6] = [
    DEFAULT_ACCESS,
    ROW_OWNER,
    GROUP_READ_ONLY,
    GROUP_MODIFY,
    GROUP_PRIVILEGED,
    SYNC_STATE,
];

pub struct Query;

impl Query {
    /// Run an arbitrary SELECT under the caller's row-level permissions.
    ///
    /// When the statement projects all six permission columns it is wrapped:
    /// an `_effective_access` column is computed per row and, for
    /// non-privileged callers, rows the caller may not see are filtered out.
    /// Statements missing any of those columns run unwrapped and gain no
    /// access column.
    pub fn raw_query(
        db: &Database,
        table_id: Option<&str>,
        sql: &str,
        args: &[DataValue],
        bounds: Option<QueryBounds>,
        user: &UserContext,
    ) -> Result<ResultSet, StoreError> {
        let ctx = get_access_context(&db.conn, table_id, user)?;
        Self::run(db, sql, args, bounds, &ctx)
    }

    /// As `raw_query`, but with internal privileges: every row is visible
    /// and `_effective_access` is forced to 'rwdp'.
    pub fn privileged_raw_query(
        db: &Database,
        table_id: Option<&str>,
        sql: &str,
        args: &[DataValue],
        bounds: Option<QueryBounds>,
        user: &UserContext,
    ) -> Result<ResultSet, StoreError> {
        let ctx = get_access_context(&db.conn, table_id, user)?.copy_as_privileged_user();
        Self::run(db, sql, args, bounds, &ctx)
    }

    /// Convenience SELECT over one table with an optional WHERE fragment.
    pub fn query(
        db: &Database,
        table_id: &str,
        where_clause: Option<&str>,
        args: &[DataValue],
        order_by: Option<&str>,
        bounds: Option<QueryBounds>,
        user: &UserContext,
    ) -> Result<ResultSet, StoreError> {
        let sql = Self::build_select(table_id, where_clause, order_by);
        Self::raw_query(db, Some(table_id), &sql, args, bounds, user)
    }

    pub fn privileged_query(
        db: &Database,
        table_id: &str,
        where_clause: Option<&str>,
        args: &[DataValue],
        order_by: Option<&str>,
        bounds: Option<QueryBounds>,
        user: &UserContext,
    ) -> Result<ResultSet, StoreError> {
        let sql = Self::build_select(table_id, where_clause, order_by);
        Self::privileged_raw_query(db, Some(table_id), &sql, args, bounds, user)
    }

    fn build_select(table_id: &str, where_clause: Option<&str>, order_by: Option<&str>) -> String {
        let mut sql = format!("SELECT * FROM \"{table_id}\"");
        if let Some(clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(order) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        sql
    }

    fn run(
        db: &Database,
        sql: &str,
        args: &[DataValue],
        bounds: Option<QueryBounds>,
        ctx: &AccessContext,
    ) -> Result<ResultSet, StoreError> {
        // probe the statement's projection without executing it
        let projected: Vec<String> = {
            let stmt = db.conn.prepare(sql)?;
            stmt.column_names().iter().map(|s| s.to_string()).collect()
        };
        let wrappable = REQUIRED_WRAP_COLUMNS
            .iter()
            .all(|c| projected.iter().any(|p| p == c));

        let mut case_args: Vec<String> = Vec::new();
        let mut filter_args: Vec<String> = Vec::new();
        let mut full_sql;
        if wrappable {
            full_sql = String::from("SELECT *");
            access::build_access_rights(&mut full_sql, &mut case_args, ctx);
            full_sql.push_str(&format!(" FROM ({sql}) AS T"));
            if !ctx.is_privileged_user() {
                access::append_visibility_filter(&mut full_sql, &mut filter_args, ctx);
            }
        } else {
            full_sql = sql.to_owned();
        }
        if let Some(bounds) = bounds {
            full_sql.push_str(&bounds.sql_suffix());
        }

        // bind order follows textual order: access CASE, inner statement,
        // then the visibility predicate
        let bind: Vec<Value> = case_args
            .into_iter()
            .map(Value::Text)
            .chain(args.iter().map(DataValue::to_value))
            .chain(filter_args.into_iter().map(Value::Text))
            .collect();

        let mut stmt = db.conn.prepare(&full_sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let width = columns.len();
        let mapped = stmt.query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            let mut out = Vec::with_capacity(width);
            for i in 0..width {
                let value: Value = row.get(i)?;
                out.push(value_to_opt_string(&value));
            }
            Ok(out)
        })?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(ResultSet { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::Column;
    use crate::rows::{Rows, RowValues, SyncState, EFFECTIVE_ACCESS, ROW_OWNER};
    use crate::tables::Tables;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        Tables::create_or_open_table_with_columns(
            &db,
            "survey",
            vec![Column::new("name", "name", "string", None)],
        )
        .unwrap();
        db
    }

    fn insert(db: &Database, row_id: &str, name: &str, user: &UserContext) {
        let ordered = crate::columns::OrderedColumns::from_database(&db.conn, "survey").unwrap();
        let mut values = RowValues::new();
        values.insert("name".to_string(), DataValue::Text(name.to_string()));
        Rows::insert_row_with_id(db, &ordered, &values, row_id, user).unwrap();
    }

    fn set_access(db: &Database, row_id: &str, access: &str) {
        db.conn
            .execute(
                "UPDATE \"survey\" SET _default_access = ?, _sync_state = ? WHERE _id = ?",
                rusqlite::params![access, SyncState::Synced.as_ref(), row_id],
            )
            .unwrap();
    }

    #[test]
    fn select_star_gains_effective_access_column() {
        let db = setup();
        let user = UserContext::new("user1", Some(r#"["ROLE_USER"]"#), None);
        insert(&db, "r1", "Ada", &user);

        let result = Query::query(&db, "survey", None, &[], None, None, &user).unwrap();
        assert_eq!(result.len(), 1);
        // a new_row grants full rights to its creator
        assert_eq!(result.get(0, EFFECTIVE_ACCESS), Some("rwdp"));
        assert_eq!(result.get(0, "name"), Some("Ada"));
    }

    #[test]
    fn hidden_rows_filtered_for_ordinary_users() {
        let db = setup();
        let owner = UserContext::new("owner1", Some(r#"["ROLE_USER"]"#), None);
        insert(&db, "r1", "visible", &owner);
        insert(&db, "r2", "hidden", &owner);
        set_access(&db, "r1", "FULL");
        set_access(&db, "r2", "HIDDEN");

        let stranger = UserContext::new("stranger", None, None);
        let result = Query::query(&db, "survey", None, &[], None, None, &stranger).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(0, "name"), Some("visible"));

        // the owner sees both rows through the owner clause
        let result = Query::query(&db, "survey", None, &[], None, None, &owner).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn privileged_query_sees_everything_as_rwdp() {
        let db = setup();
        let owner = UserContext::new("owner1", Some(r#"["ROLE_USER"]"#), None);
        insert(&db, "r1", "hidden", &owner);
        set_access(&db, "r1", "HIDDEN");

        let stranger = UserContext::new("stranger", None, None);
        let result =
            Query::privileged_query(&db, "survey", None, &[], None, None, &stranger).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(0, EFFECTIVE_ACCESS), Some("rwdp"));
    }

    #[test]
    fn group_membership_reveals_rows() {
        let db = setup();
        let owner = UserContext::new("owner1", Some(r#"["ROLE_USER"]"#), None);
        insert(&db, "r1", "team row", &owner);
        set_access(&db, "r1", "HIDDEN");
        db.conn
            .execute(
                "UPDATE \"survey\" SET _group_read_only = 'GROUP_field' WHERE _id = 'r1'",
                [],
            )
            .unwrap();

        let outsider = UserContext::new("user2", Some(r#"["ROLE_USER"]"#), None);
        let result = Query::query(&db, "survey", None, &[], None, None, &outsider).unwrap();
        assert!(result.is_empty());

        let member = UserContext::new("user3", Some(r#"["ROLE_USER","GROUP_field"]"#), None);
        let result = Query::query(&db, "survey", None, &[], None, None, &member).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(0, EFFECTIVE_ACCESS), Some("r"));
    }

    #[test]
    fn projection_without_permission_columns_runs_unwrapped() {
        let db = setup();
        let owner = UserContext::new("owner1", Some(r#"["ROLE_USER"]"#), None);
        insert(&db, "r1", "hidden", &owner);
        set_access(&db, "r1", "HIDDEN");

        let stranger = UserContext::new("stranger", None, None);
        let result = Query::raw_query(
            &db,
            Some("survey"),
            "SELECT name FROM \"survey\"",
            &[],
            None,
            &stranger,
        )
        .unwrap();
        // no permission columns projected: no filtering, no access column
        assert_eq!(result.len(), 1);
        assert_eq!(result.column_index(EFFECTIVE_ACCESS), None);
    }

    #[test]
    fn bounds_clamp_and_page() {
        let db = setup();
        let user = UserContext::new("user1", Some(r#"["ROLE_USER"]"#), None);
        for i in 0..5 {
            insert(&db, &format!("r{i}"), &format!("row {i}"), &user);
        }

        let page = Query::query(
            &db,
            "survey",
            None,
            &[],
            Some("_id ASC"),
            Some(QueryBounds::new(2, 1)),
            &user,
        )
        .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.get(0, "name"), Some("row 1"));

        // non-positive limit means unbounded; negative offset means zero
        let all = Query::query(
            &db,
            "survey",
            None,
            &[],
            Some("_id ASC"),
            Some(QueryBounds::new(0, -7)),
            &user,
        )
        .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn where_arguments_bind_after_access_case() {
        let db = setup();
        let user = UserContext::new("user1", Some(r#"["ROLE_USER","GROUP_a"]"#), None);
        insert(&db, "r1", "Ada", &user);
        insert(&db, "r2", "Grace", &user);

        let result = Query::query(
            &db,
            "survey",
            Some("name = ?"),
            &[DataValue::Text("Grace".to_string())],
            None,
            None,
            &user,
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(0, ROW_OWNER), Some("user1"));
    }
}
