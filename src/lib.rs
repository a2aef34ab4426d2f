//! # Stratadb - Tiered Record Store for Toolchain Configuration
//!
//! Schema-driven persistence core for scientific computing toolchain
//! configuration.
//!
//! Stratadb provides:
//! - A schema registry with declared models and two-pass association linking
//! - Three interchangeable storage backends: local JSON document file,
//!   local SQLite file with JSON columns, remote REST store
//! - A controller that enforces validation, uniqueness, association
//!   symmetry and compatibility constraints under reentrant transactions
//! - Content-digest record identity and hash-based push/pull replication
//!   between storage tiers

pub mod config;
pub mod controller;
pub mod record;
pub mod registry;
pub mod replicate;
pub mod schema;
pub mod storage;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenient access
pub use controller::Controller;
pub use record::{DIGEST_FIELD, Record};
pub use registry::{ModelHooks, Registry, RegistryBuilder};
pub use replicate::{Replicator, TransportMode};
pub use schema::{Attribute, Direction, Schema};
pub use storage::{Key, Matcher, StorageBackend};
pub use value::{Eid, Value, ValueType};

/// Result type alias for stratadb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stratadb operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed model declaration. Fatal at registry build, never raised
    /// by a runtime operation.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Unknown attribute, wrong type, or missing required field. Raised
    /// before any mutation reaches the backend.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate value in a unique attribute. Raised before insert.
    #[error("Unique constraint violated: {model}.{attribute} = {value} already exists")]
    UniqueConstraint {
        model: String,
        attribute: String,
        value: String,
    },

    /// A `Require`/`Exclude` compatibility rule failed between two
    /// associated records.
    #[error("Incompatible records: {0}")]
    IncompatibleRecord(String),

    /// A digest suffix matched more than one record.
    #[error("Ambiguous hash suffix '{suffix}': {count} records match")]
    AmbiguousHash { suffix: String, count: usize },

    /// A referenced record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Write attempted against a read-only store.
    #[error("Storage is read-only: {0}")]
    ReadOnly(String),

    /// Backend failure that fits none of the wrapped error types below:
    /// malformed stored document, unusable table name, missing connection.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True for errors a caller can fix by changing its input, as opposed
    /// to backend connectivity failures.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UniqueConstraint { .. }
                | Error::IncompatibleRecord(_)
                | Error::AmbiguousHash { .. }
                | Error::NotFound(_)
        )
    }
}
