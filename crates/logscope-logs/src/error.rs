//! Error types for the log data engine

use thiserror::Error;

use crate::context::ContextId;

/// Errors raised by an importer while reading a source file
#[derive(Debug, Error)]
pub enum ImportError {
    /// I/O error when reading the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be parsed; `line` is 1-based from the start of the file
    #[error("parse error at line {line}: {message}")]
    Parse { line: u64, message: String },
}

/// Errors that can occur during engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The import was cancelled; already committed events stay in the store
    #[error("import cancelled")]
    ImportCancelled,

    /// An import is already running for this session
    #[error("import already running")]
    ImportAlreadyRunning,

    /// The context handle is closed or was never opened
    #[error("invalid context: {0}")]
    InvalidContext(ContextId),

    /// The session was opened against a storage backend that does not exist
    #[error("unsupported storage backend: {0}")]
    UnsupportedStorageBackend(String),

    /// A filter or sort expression could not be parsed
    #[error("invalid query expression at {position}: {message}")]
    InvalidQueryExpression { position: usize, message: String },

    /// The caller's cancellation token fired during a read operation
    #[error("operation cancelled")]
    Cancelled,

    /// Error from the importer
    #[error("import failed: {0}")]
    Import(#[from] ImportError),
}

/// A specialized Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
