//! Error types for the notes export engine.

use thiserror::Error;

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for export, import and collaborator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Note not found
    #[error("Note not found: {0}")]
    NoteNotFound(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unique key already taken in the store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Note store rejected or failed an operation
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Archive could not be read or written
    #[error("Archive error: {0}")]
    Archive(String),

    /// Operation stopped because its job was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Import failed while replaying one note
    #[error("Import of note '{note}' failed: {source}")]
    Import {
        note: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with the name of the note being imported.
    pub fn import(note: impl Into<String>, source: Error) -> Self {
        match source {
            already @ Error::Import { .. } => already,
            other => Error::Import {
                note: note.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(e.to_string())
    }
}
