//! DDL and name constants for the five catalog tables.
//!
//! The table and column names are stable, persisted identifiers. Existing
//! stores depend on them; do not reorder or rename.

pub const TABLE_DEFS_TABLE: &str = "_table_definitions";
pub const COLUMN_DEFS_TABLE: &str = "_column_definitions";
pub const KVS_TABLE: &str = "_key_value_store_active";
pub const CHOICE_LISTS_TABLE: &str = "_choice_lists";
pub const SYNC_ETAGS_TABLE: &str = "_sync_etags";

pub const CREATE_SCHEMA_SQL: &str = "
BEGIN;

CREATE TABLE IF NOT EXISTS _table_definitions (
    _table_id TEXT NOT NULL PRIMARY KEY,
    _schema_etag TEXT NULL,
    _last_data_etag TEXT NULL,
    _last_sync_time TEXT NULL,
    _rev_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _column_definitions (
    _table_id TEXT NOT NULL,
    _element_key TEXT NOT NULL,
    _element_name TEXT NULL,
    _element_type TEXT NULL,
    _list_child_element_keys TEXT NULL,
    PRIMARY KEY (_table_id, _element_key)
);

CREATE TABLE IF NOT EXISTS _key_value_store_active (
    _table_id TEXT NOT NULL,
    _partition TEXT NOT NULL,
    _aspect TEXT NOT NULL,
    _key TEXT NOT NULL,
    _type TEXT NOT NULL,
    _value TEXT NOT NULL,
    PRIMARY KEY (_table_id, _partition, _aspect, _key)
);

CREATE TABLE IF NOT EXISTS _choice_lists (
    _choice_list_id TEXT NOT NULL PRIMARY KEY,
    _choice_list_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _sync_etags (
    _table_id TEXT NOT NULL,
    _is_manifest INTEGER NOT NULL,
    _url TEXT NOT NULL,
    _last_modified TEXT NOT NULL,
    _etag_md5_hash TEXT NOT NULL,
    PRIMARY KEY (_table_id, _is_manifest, _url)
);

COMMIT;
";
