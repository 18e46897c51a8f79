//! formstore is the device-resident relational store of an offline form
//! collection platform. It keeps user tables in SQLite alongside a small
//! catalog describing their columns and metadata, enforces row-level access
//! control on every read and write, and tracks each row's relationship with
//! a sync server: drafts (checkpoints), local edits, tombstoned deletes,
//! and two-sided conflicts awaiting user resolution.
//!
//! Open a [`database::Database`], create tables through
//! [`tables::Tables`], and mutate rows through [`rows::Rows`]. Reads go
//! through [`query::Query`], which computes a per-row `_effective_access`
//! column and filters rows the caller may not see. The sync engine drives
//! [`sync::Sync`] with its internal identity.

pub mod access;
pub mod attachments;
pub mod choices;
pub mod columns;
pub mod config;
pub mod database;
pub mod error;
pub mod etags;
pub mod kvs;
pub mod query;
pub mod rows;
pub mod schema;
pub mod sync;
pub mod tables;
