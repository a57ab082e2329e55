//! Error types shared by the scanner, the cache and the repository.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that propagate out of share indexing operations.
///
/// Recoverable conditions (malformed match expressions, lookup misses) never show up
/// here; they are logged and turned into empty results where they happen.
#[derive(Debug, Error)]
pub enum Error {
    /// A share root could not be enumerated.
    #[error("Failed to enumerate share root {}: {source}", root.display())]
    Scan {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The SQLite store failed underneath us.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A persisted attribute payload could not be encoded or decoded.
    #[error("Invalid attribute payload for {masked}: {source}")]
    Attributes {
        masked: String,
        #[source]
        source: serde_json::Error,
    },

    /// A persisted modification time could not be parsed.
    #[error("Invalid touch timestamp for {masked}: {source}")]
    Timestamp {
        masked: String,
        #[source]
        source: chrono::ParseError,
    },

    /// Configuration could not be read or understood.
    #[error("Invalid configuration {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error for `path`.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a scan error for a share root.
    pub fn scan(root: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Scan {
            root: root.into(),
            source: source.into(),
        }
    }

    /// Whether this error means the backing store itself is unusable.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = Error::config("/etc/shareindex.json", "missing shares");
        assert_eq!(
            err.to_string(),
            "Invalid configuration /etc/shareindex.json: missing shares"
        );
        assert!(!err.is_storage());
    }

    #[test]
    fn test_storage_error_from_rusqlite() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_storage());
    }
}
