use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Content-addressed choice lists. The identifier is the hex digest of the
/// JSON text, so identical lists shared by many columns store once.
pub struct ChoiceLists;

impl ChoiceLists {
    /// Register a choice list and return its id. Empty input clears
    /// nothing and returns None.
    pub fn set_choice_list(
        conn: &Connection,
        choice_list_json: &str,
    ) -> Result<Option<String>, StoreError> {
        if choice_list_json.trim().is_empty() {
            return Ok(None);
        }
        let id = Self::choice_list_id(choice_list_json);
        conn.execute(
            "INSERT OR REPLACE INTO _choice_lists (_choice_list_id, _choice_list_json)
             VALUES (?, ?)",
            params![id, choice_list_json],
        )?;
        Ok(Some(id))
    }

    pub fn get_choice_list(
        conn: &Connection,
        choice_list_id: &str,
    ) -> Result<Option<String>, StoreError> {
        if choice_list_id.is_empty() {
            return Ok(None);
        }
        conn.query_row(
            "SELECT _choice_list_json FROM _choice_lists WHERE _choice_list_id = ?",
            [choice_list_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::Storage)
    }

    fn choice_list_id(choice_list_json: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(choice_list_json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_and_dedup() {
        let db = Database::open_in_memory().unwrap();
        let json = r#"[{"data_value":"yes"},{"data_value":"no"}]"#;

        let id1 = ChoiceLists::set_choice_list(&db.conn, json).unwrap().unwrap();
        let id2 = ChoiceLists::set_choice_list(&db.conn, json).unwrap().unwrap();
        assert_eq!(id1, id2);

        let stored = ChoiceLists::get_choice_list(&db.conn, &id1).unwrap();
        assert_eq!(stored.as_deref(), Some(json));

        let count: i64 = db
            .conn
            .query_row("SELECT count(*) FROM _choice_lists", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_inputs_are_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(ChoiceLists::set_choice_list(&db.conn, "  ").unwrap().is_none());
        assert!(ChoiceLists::get_choice_list(&db.conn, "").unwrap().is_none());
    }
}
