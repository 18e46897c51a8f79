use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::{params, Connection};
use strum::{AsRefStr, Display, EnumString};

use crate::error::StoreError;

/// The eight storable element data types. The wire token is the lowercase
/// name; it appears in `_element_type` and in KVS `_type` fields.
#[derive(AsRefStr, Display, EnumString, Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum ElementDataType {
    #[strum(serialize = "string")]
    String,
    #[strum(serialize = "integer")]
    Integer,
    #[strum(serialize = "number")]
    Number,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "array")]
    Array,
    #[strum(serialize = "object")]
    Object,
    #[strum(serialize = "rowpath")]
    RowPath,
    #[strum(serialize = "configpath")]
    ConfigPath,
}

impl ElementDataType {
    /// Physical SQLite column type for a retained column of this type.
    pub fn storage_type(&self) -> &'static str {
        match self {
            ElementDataType::Integer | ElementDataType::Bool => "INTEGER",
            ElementDataType::Number => "REAL",
            _ => "TEXT",
        }
    }

    /// Resolve a declared element type expression. Unknown type names are
    /// treated as object when the column has children (composite custom
    /// types such as geopoint) and as string otherwise.
    pub fn from_element_type(element_type: Option<&str>, has_children: bool) -> Self {
        if let Some(name) = element_type {
            if let Ok(dt) = name.parse::<ElementDataType>() {
                return dt;
            }
        }
        if has_children {
            ElementDataType::Object
        } else {
            ElementDataType::String
        }
    }
}

/// A user column as declared by the caller and persisted in
/// `_column_definitions`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub element_key: String,
    pub element_name: Option<String>,
    pub element_type: Option<String>,
    /// JSON array of child element keys, for composite types.
    pub list_child_element_keys: Option<String>,
}

impl Column {
    pub fn new(
        element_key: &str,
        element_name: &str,
        element_type: &str,
        list_child_element_keys: Option<&str>,
    ) -> Self {
        Column {
            element_key: element_key.to_owned(),
            element_name: Some(element_name.to_owned()),
            element_type: Some(element_type.to_owned()),
            list_child_element_keys: list_child_element_keys.map(str::to_owned),
        }
    }

    fn parse_children(&self) -> Result<Vec<String>, StoreError> {
        match self.list_child_element_keys.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(json) => serde_json::from_str::<Vec<String>>(json).map_err(|e| {
                StoreError::InvalidValueShape(format!(
                    "child element keys of '{}' are not a JSON string array: {e}",
                    self.element_key
                ))
            }),
        }
    }
}

/// A resolved column: declaration plus derived type and retention facts.
#[derive(Clone, Debug)]
pub struct ColumnDefinition {
    pub column: Column,
    pub children: Vec<String>,
    pub data_type: ElementDataType,
    pub is_unit_of_retention: bool,
}

impl ColumnDefinition {
    pub fn element_key(&self) -> &str {
        &self.column.element_key
    }

    pub fn element_name(&self) -> &str {
        self.column
            .element_name
            .as_deref()
            .unwrap_or(&self.column.element_key)
    }
}

/// The validated column set of one table, keyed and ordered by element key.
///
/// Only unit-of-retention columns materialize as physical storage columns.
/// A column retains when it is a leaf or an array; composite parents with
/// children (objects) are virtual and serialize through their children.
#[derive(Clone, Debug)]
pub struct OrderedColumns {
    pub table_id: String,
    defns: BTreeMap<String, ColumnDefinition>,
}

impl OrderedColumns {
    pub fn build(table_id: &str, columns: Vec<Column>) -> Result<Self, StoreError> {
        if table_id.is_empty() {
            return Err(StoreError::Invalid("tableId must be specified".to_string()));
        }

        let mut parsed: HashMap<String, (Column, Vec<String>)> = HashMap::new();
        for col in columns {
            if col.element_key.is_empty() {
                return Err(StoreError::Invalid(
                    "column elementKey must be specified".to_string(),
                ));
            }
            let children = col.parse_children()?;
            if parsed
                .insert(col.element_key.clone(), (col, children))
                .is_some()
            {
                return Err(StoreError::Invalid(format!(
                    "duplicate column elementKey in table '{table_id}'"
                )));
            }
        }

        // every child must be declared, and belong to exactly one parent
        let mut child_of: HashMap<&str, &str> = HashMap::new();
        for (key, (_, children)) in &parsed {
            for child in children {
                if !parsed.contains_key(child.as_str()) {
                    return Err(StoreError::Invalid(format!(
                        "column '{key}' references undeclared child '{child}'"
                    )));
                }
                if child_of.insert(child.as_str(), key.as_str()).is_some() {
                    return Err(StoreError::Invalid(format!(
                        "column '{child}' has more than one parent"
                    )));
                }
            }
        }

        let roots: Vec<String> = parsed
            .keys()
            .filter(|k| !child_of.contains_key(k.as_str()))
            .cloned()
            .collect();

        let mut retained: HashSet<String> = HashSet::new();
        let mut stack = roots;
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(key) = stack.pop() {
            if !visited.insert(key.clone()) {
                return Err(StoreError::Invalid(format!(
                    "column '{key}' participates in a cycle"
                )));
            }
            let (col, children) = &parsed[&key];
            let data_type =
                ElementDataType::from_element_type(col.element_type.as_deref(), !children.is_empty());
            if children.is_empty() || data_type == ElementDataType::Array {
                // leaves and arrays store directly; array children are
                // virtual item prototypes
                retained.insert(key);
            } else {
                for child in children {
                    stack.push(child.clone());
                }
            }
        }

        let mut defns = BTreeMap::new();
        for (key, (col, children)) in parsed {
            let data_type =
                ElementDataType::from_element_type(col.element_type.as_deref(), !children.is_empty());
            let is_unit_of_retention = retained.contains(&key);
            defns.insert(
                key,
                ColumnDefinition {
                    column: col,
                    children,
                    data_type,
                    is_unit_of_retention,
                },
            );
        }

        Ok(OrderedColumns {
            table_id: table_id.to_owned(),
            defns,
        })
    }

    /// Load and resolve the persisted column set of a table.
    pub fn from_database(conn: &Connection, table_id: &str) -> Result<Self, StoreError> {
        let columns = get_user_defined_columns(conn, table_id)?;
        Self::build(table_id, columns)
    }

    pub(crate) fn persist(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO _column_definitions
               (_table_id, _element_key, _element_name, _element_type, _list_child_element_keys)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        for defn in self.defns.values() {
            stmt.execute(params![
                self.table_id,
                defn.column.element_key,
                defn.column.element_name,
                defn.column.element_type,
                defn.column.list_child_element_keys,
            ])?;
        }
        Ok(())
    }

    pub fn get(&self, element_key: &str) -> Option<&ColumnDefinition> {
        self.defns.get(element_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.defns.values()
    }

    pub fn retained(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.defns.values().filter(|d| d.is_unit_of_retention)
    }

    /// Element keys of retained columns whose type is rowpath. These are
    /// the attachment-bearing columns the sync layer inspects.
    pub fn rowpath_keys(&self) -> Vec<String> {
        self.retained()
            .filter(|d| d.data_type == ElementDataType::RowPath)
            .map(|d| d.element_key().to_owned())
            .collect()
    }

    pub fn columns(&self) -> Vec<Column> {
        self.defns.values().map(|d| d.column.clone()).collect()
    }
}

/// The declared columns of a table, ordered by element key.
pub fn get_user_defined_columns(
    conn: &Connection,
    table_id: &str,
) -> Result<Vec<Column>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT _element_key, _element_name, _element_type, _list_child_element_keys
         FROM _column_definitions
         WHERE _table_id = ?
         ORDER BY _element_key ASC",
    )?;
    let rows = stmt.query_map([table_id], |row| {
        Ok(Column {
            element_key: row.get(0)?,
            element_name: row.get(1)?,
            element_type: row.get(2)?,
            list_child_element_keys: row.get(3)?,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

/// All physical column names of a user table, admin columns included.
pub fn get_all_column_names(conn: &Connection, table_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table_id}\")"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn geopoint_columns() -> Vec<Column> {
        vec![
            Column::new(
                "location",
                "location",
                "geopoint",
                Some(r#"["location_latitude","location_longitude","location_accuracy"]"#),
            ),
            Column::new("location_latitude", "latitude", "number", None),
            Column::new("location_longitude", "longitude", "number", None),
            Column::new("location_accuracy", "accuracy", "number", None),
            Column::new("name", "name", "string", None),
            Column::new("photos", "photos", "array", Some(r#"["photos_items"]"#)),
            Column::new("photos_items", "items", "rowpath", None),
        ]
    }

    #[test]
    fn composite_parents_are_virtual() {
        let ordered = OrderedColumns::build("survey", geopoint_columns()).unwrap();

        assert!(!ordered.get("location").unwrap().is_unit_of_retention);
        assert!(ordered.get("location_latitude").unwrap().is_unit_of_retention);
        assert!(ordered.get("name").unwrap().is_unit_of_retention);
        // arrays retain as JSON text; their item prototype does not
        assert!(ordered.get("photos").unwrap().is_unit_of_retention);
        assert!(!ordered.get("photos_items").unwrap().is_unit_of_retention);
    }

    #[test]
    fn unknown_composite_type_resolves_to_object() {
        let ordered = OrderedColumns::build("survey", geopoint_columns()).unwrap();
        assert_eq!(
            ordered.get("location").unwrap().data_type,
            ElementDataType::Object
        );
        assert_eq!(
            ordered.get("location_latitude").unwrap().data_type,
            ElementDataType::Number
        );
    }

    #[test]
    fn storage_types() {
        assert_eq!(ElementDataType::Integer.storage_type(), "INTEGER");
        assert_eq!(ElementDataType::Bool.storage_type(), "INTEGER");
        assert_eq!(ElementDataType::Number.storage_type(), "REAL");
        assert_eq!(ElementDataType::RowPath.storage_type(), "TEXT");
        assert_eq!(ElementDataType::Array.storage_type(), "TEXT");
    }

    #[test]
    fn undeclared_child_rejected() {
        let cols = vec![Column::new(
            "point",
            "point",
            "geopoint",
            Some(r#"["missing"]"#),
        )];
        assert!(matches!(
            OrderedColumns::build("t", cols),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn duplicate_key_rejected() {
        let cols = vec![
            Column::new("a", "a", "string", None),
            Column::new("a", "a", "string", None),
        ];
        assert!(OrderedColumns::build("t", cols).is_err());
    }
}
