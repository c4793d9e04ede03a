//! Error types for session handling

use std::path::PathBuf;

use logscope_logs::EngineError;
use thiserror::Error;

/// Errors that can occur while opening, saving or importing a session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Error from the log data engine
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O error on session files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session config or info file is not valid JSON
    #[error("invalid session file: {0}")]
    Json(#[from] serde_json::Error),

    /// No `.session.logscope` file in the directory
    #[error("session info file not found: {}", .0.display())]
    SessionNotFound(PathBuf),

    /// The session directory itself is missing
    #[error("session directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    /// An import source refers to a profile that is not registered
    #[error("importer profile {0:?} does not exist")]
    UnknownImporterProfile(String),

    /// A profile refers to an importer that is not registered
    #[error("importer {0:?} does not exist")]
    UnknownImporter(String),

    /// An import source file pattern could not be compiled
    #[error("invalid source pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl SessionError {
    /// Whether this is a cancelled import rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Engine(EngineError::ImportCancelled))
    }
}

/// A specialized Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
