use std::path::Path;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use logscope_types::{FileId, ImportProgress, LogEvent, ProgressData};

use crate::error::ImportError;

/// An event read by an importer, with the absolute byte offset just after it
#[derive(Clone, Debug, PartialEq)]
pub struct ImportedEvent {
    pub event: LogEvent,
    pub offset: u64,
}

impl ImportedEvent {
    pub fn new(event: LogEvent, offset: u64) -> Self {
        Self { event, offset }
    }
}

/// Stream of events produced by an importer
pub type ImportStream = BoxStream<'static, Result<ImportedEvent, ImportError>>;

/// Reads log events from a source file
///
/// The engine never seeks in the stream itself. An importer that returns
/// true from [`Importer::supports_resume`] must start reading at
/// `start_offset`; other importers are always called with offset 0.
pub trait Importer: Send + Sync {
    /// Whether `start_offset` is honoured
    fn supports_resume(&self) -> bool {
        false
    }

    fn import_logs(&self, path: &Path, start_offset: u64, cancel: CancellationToken) -> ImportStream;
}

/// Outcome of importing one file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportSummary {
    pub file_id: FileId,
    /// Events appended to the store
    pub imported: usize,
    /// Events dropped because they were outside the time range
    pub skipped: usize,
    /// Committed byte offset after the import
    pub offset: u64,
}

/// Publishes two-level import progress through a watch channel
///
/// The main bar counts bytes over all files of a run, the secondary bar
/// counts bytes of the current file.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<ImportProgress>>,
}

impl ProgressReporter {
    pub fn new() -> (Self, watch::Receiver<ImportProgress>) {
        let (tx, rx) = watch::channel(ImportProgress::default());
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportProgress> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ImportProgress {
        self.tx.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ImportProgress)) {
        self.tx.send_modify(f);
    }

    /// Reset the secondary bar for a file starting at `offset` of `size` bytes
    pub fn start_file(&self, name: &str, size: u64, offset: u64) {
        self.update(|p| {
            p.item = Some(name.to_string());
            p.secondary = Some(ProgressData::new(size as f64, offset as f64));
            p.main.value += offset as f64;
        });
    }

    /// Advance the current file to `offset`, moving the main bar by the same delta
    pub fn file_progress(&self, offset: u64) {
        self.tx.send_if_modified(|p| {
            let Some(secondary) = p.secondary.as_mut() else {
                return false;
            };
            let delta = offset as f64 - secondary.value;
            if delta == 0.0 {
                return false;
            }
            secondary.value = offset as f64;
            p.main.value += delta;
            true
        });
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_progress_moves_main_bar() {
        let (reporter, rx) = ProgressReporter::new();
        reporter.update(|p| p.main = ProgressData::new(300.0, 0.0));

        reporter.start_file("a.clef", 100, 0);
        reporter.file_progress(40);
        reporter.file_progress(100);
        reporter.start_file("b.clef", 200, 50);
        reporter.file_progress(120);

        let progress = rx.borrow().clone();
        assert_eq!(progress.item.as_deref(), Some("b.clef"));
        assert_eq!(progress.main.value, 220.0);
        assert_eq!(progress.secondary, Some(ProgressData::new(200.0, 120.0)));
    }
}
