// src/error.rs

use thiserror::Error;

/// Core error types for pvector
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Version string outside the `[epoch:]upstream[-revision]` grammar
    #[error("Malformed version string: {0:?}")]
    MalformedVersion(String),

    /// The extractor could not read the package archive
    #[error("Corrupted package archive {path}: {reason}")]
    CorruptedArchive { path: String, reason: String },

    /// The extractor itself cannot be run
    #[error("Package extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    /// Malformed metadata or configuration input
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A reconcile pass was interrupted before committing
    #[error("Scan of {0} cancelled before commit")]
    Cancelled(String),
}

impl Error {
    /// Shorthand for a `CorruptedArchive` error
    pub fn corrupted(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptedArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using pvector's Error type
pub type Result<T> = std::result::Result<T, Error>;
