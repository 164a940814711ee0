pub mod repository;
pub mod sqlite;

pub use repository::*;
pub use sqlite::*;

use chrono::Utc;
use thiserror::Error;

/// Current UTC time in the ISO-8601 form used for every stored timestamp.
/// Microsecond precision, so lexicographic order matches enqueue order even
/// for documents created within the same second.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Malformed stored payload: {0}")]
    BadPayload(String),
}
