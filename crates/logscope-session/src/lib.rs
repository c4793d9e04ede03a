//! Session handling for logscope
//!
//! A session is a directory holding a `.session.logscope` marker, a data
//! directory with the session config, and the import sources that feed the
//! in-memory event store.

mod config;
mod error;
mod importers;
mod session;
mod sources;

pub use config::{
    CONFIG_FILE_NAME, ConfigStorage, FileConfigStorage, FilterSettings, ImportSource,
    MemoryConfigStorage, SessionConfig, SessionInfo,
};
pub use error::{Result, SessionError};
pub use importers::{ImporterProfile, ImporterRegistry};
pub use session::{
    DATA_DIRECTORY_NAME, FileImport, IN_MEMORY_STORAGE_ID, ImportReport, LogSession, PageRequest,
    SESSION_INFO_FILE_NAME, SessionEvent,
};
pub use sources::{compile_glob, expand_source};
