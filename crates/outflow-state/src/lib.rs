//! Metadata persistence for the outflow engine.
//!
//! Provides the [`MetadataStore`] trait with `SQLite` and `PostgreSQL`
//! implementations. The store owns sync definitions, cursor positions, and
//! the sync-run audit trail.

#![warn(clippy::pedantic)]

pub mod backend;
mod codec;
pub mod error;
pub mod postgres;
pub mod sqlite;

pub use backend::{MetadataStore, NewSync};
pub use error::StateError;
pub use postgres::PostgresMetadataStore;
pub use sqlite::SqliteMetadataStore;

/// Common imports for store consumers.
pub mod prelude {
    pub use crate::backend::{MetadataStore, NewSync};
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteMetadataStore;
    pub use outflow_types::model::{
        Connection, ConnectionType, Destination, FieldMapping, FrequencyUnits, Object,
        ObjectField, Source, SyncConfig, SyncDefinition, SyncMode,
    };
    pub use outflow_types::schema::FieldType;
    pub use outflow_types::state::{OrgId, RunId, RunOutcome, RunStatus, SyncId, SyncRun};
}
