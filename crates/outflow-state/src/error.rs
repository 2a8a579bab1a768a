//! Metadata store error types.

/// Errors produced by [`MetadataStore`](crate::MetadataStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Underlying `PostgreSQL` failure.
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("metadata store lock poisoned")]
    LockPoisoned,

    /// A referenced definition does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// A stored value could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl StateError {
    pub(crate) fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::Sqlite(inner);
        assert!(err.to_string().contains("sqlite"), "got: {err}");
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(
            StateError::LockPoisoned.to_string(),
            "metadata store lock poisoned"
        );
    }

    #[test]
    fn not_found_names_kind() {
        let err = StateError::not_found("sync", 42);
        assert_eq!(err.to_string(), "sync '42' not found");
    }
}
