//! Log data engine for logscope
//!
//! This crate provides the in-memory event store, the property catalog, view
//! contexts, the query engine, the hierarchical filter tree, and the importer
//! contract together with a CLEF importer.

mod catalog;
mod clef;
mod context;
mod error;
mod filter_tree;
mod import;
pub mod query;
mod store;

pub use catalog::PropertyCatalog;
pub use clef::{CLEF_IMPORTER_ID, ClefImporter, parse_clef_line};
pub use context::{ContextId, ContextInfo, ContextRegistry};
pub use error::{EngineError, ImportError, Result};
pub use filter_tree::{
    ENCODED_LAYER_LEN, FilterLayer, FilterTree, LayerId, NULL_VALUE_TOKEN, Visibility,
};
pub use import::{ImportStream, ImportSummary, ImportedEvent, Importer, ProgressReporter};
pub use query::{Expr, Field, QueryPage, QueryRequest, SortDirection, SortSpec, parse_filter, parse_sort};
pub use store::{LogStore, StoreEvent};

// Re-export types used in our public API
pub use logscope_types::{
    FileId, ImportProgress, LogDataStats, LogEvent, LogFile, LogItem, LogLevel, ProgressData,
    PropertyKind, PropertyModel, PropertyValue, ScalarValue, TimeRange,
};
