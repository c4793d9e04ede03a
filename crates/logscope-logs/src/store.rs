use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logscope_types::{
    FileId, LogDataStats, LogEvent, LogFile, LogItem, PropertyKind, PropertyModel, TimeRange,
};

use crate::catalog::PropertyCatalog;
use crate::context::{ContextId, ContextInfo, ContextRegistry};
use crate::error::{EngineError, Result};
use crate::import::{ImportStream, ImportSummary, Importer, ProgressReporter};

/// Number of processed events committed to the store under one write lock
const BATCH_FLUSH_SIZE: usize = 100;

/// How many items O(n) scans process between cancellation checks
pub(crate) const CANCEL_CHECK_INTERVAL: usize = 4096;

/// Change notifications published by the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// New property names or shapes were observed (at most once per import)
    PropertiesChanged,
    FileUnloaded(FileId),
    Cleared,
}

pub(crate) struct StoreInner {
    /// Items in id order
    pub items: Vec<Arc<LogItem>>,
    pub files: BTreeMap<FileId, LogFile>,
    pub catalog: PropertyCatalog,
    next_id: u64,
    next_file_id: u32,
}

impl StoreInner {
    fn file_mut(&mut self, id: FileId) -> Option<&mut LogFile> {
        self.files.get_mut(&id)
    }

    /// Position of an item by id (items stay sorted by id)
    fn position(&self, id: u64) -> Option<usize> {
        self.items.binary_search_by_key(&id, |item| item.id).ok()
    }
}

/// Append-only in-memory event store
///
/// Clones share the same underlying data. Mutations (import commits, unload,
/// clear) take the write lock, so there is a single writer at any time;
/// queries take the read lock and may run while an import is in progress.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<RwLock<StoreInner>>,
    contexts: Arc<ContextRegistry>,
    events: broadcast::Sender<StoreEvent>,
    importing: Arc<AtomicBool>,
}

/// Events read but not yet committed
struct PendingBatch {
    file_id: FileId,
    events: Vec<LogEvent>,
    /// Offset after the last processed event, kept or skipped
    processed_offset: u64,
    committed_offset: u64,
    imported: usize,
    skipped: usize,
    properties_changed: bool,
}

/// Clears the importing flag when the import ends
struct ImportGuard(Arc<AtomicBool>);

impl ImportGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::ImportAlreadyRunning);
        }
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for ImportGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LogStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                items: Vec::new(),
                files: BTreeMap::new(),
                catalog: PropertyCatalog::new(),
                next_id: 0,
                next_file_id: 0,
            })),
            contexts: Arc::new(ContextRegistry::new()),
            events,
            importing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read()
    }

    pub(crate) fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Subscribe to store change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------------

    /// Open an independent view context
    pub fn open_context(&self) -> ContextId {
        self.contexts.open()
    }

    /// Close a context; using it afterwards fails with `InvalidContext`
    pub fn close_context(&self, id: ContextId) -> Result<()> {
        self.contexts.close(id)
    }

    pub fn context_info(&self, id: ContextId) -> Result<ContextInfo> {
        self.contexts.info(id)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Total item count
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_importing(&self) -> bool {
        self.importing.load(Ordering::Acquire)
    }

    pub fn get(&self, id: u64) -> Option<Arc<LogItem>> {
        let inner = self.inner.read();
        inner.position(id).map(|n| Arc::clone(&inner.items[n]))
    }

    pub fn files(&self) -> Vec<LogFile> {
        self.inner.read().files.values().cloned().collect()
    }

    pub fn file(&self, id: FileId) -> Option<LogFile> {
        self.inner.read().files.get(&id).cloned()
    }

    pub fn file_by_path(&self, path: &Path) -> Option<LogFile> {
        self.inner
            .read()
            .files
            .values()
            .find(|f| f.path == path)
            .cloned()
    }

    /// Snapshot of the property catalog, in order of first sighting
    pub fn properties(&self) -> Vec<PropertyModel> {
        self.inner.read().catalog.properties().to_vec()
    }

    pub fn has_property_kind(&self, name: &str, kind: PropertyKind) -> bool {
        self.inner.read().catalog.has_kind(name, kind)
    }

    /// Item count and timestamp bounds, `LogDataStats::EMPTY` for an empty store
    pub fn stats(&self, cancel: &CancellationToken) -> Result<LogDataStats> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let inner = self.inner.read();
        let Some(first) = inner.items.first() else {
            return Ok(LogDataStats::EMPTY);
        };

        let (mut min, mut max) = (first.timestamp(), first.timestamp());
        for (n, item) in inner.items.iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            min = min.min(item.timestamp());
            max = max.max(item.timestamp());
        }

        Ok(LogDataStats {
            item_count: inner.items.len(),
            first_timestamp: min,
            last_timestamp: max,
        })
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Set or clear the bookmark flag of an item; false if the id is unknown
    pub fn set_bookmark(&self, id: u64, bookmarked: bool) -> bool {
        let changed = match self.get(id) {
            Some(item) if item.is_bookmarked() != bookmarked => {
                item.set_bookmarked(bookmarked);
                true
            }
            Some(_) => return true,
            None => return false,
        };
        if changed {
            // Bookmarks are queryable, so cached counts may be off now
            self.contexts.invalidate_all();
        }
        true
    }

    /// Find or create the file record for a path
    pub fn register_file(&self, path: &Path) -> FileId {
        let mut inner = self.inner.write();
        if let Some(file) = inner.files.values().find(|f| f.path == path) {
            return file.id;
        }
        let id = FileId(inner.next_file_id);
        inner.next_file_id += 1;
        inner.files.insert(id, LogFile::new(id, path.to_path_buf()));
        id
    }

    /// Append a single event to an existing file
    pub fn append(&self, file_id: FileId, event: LogEvent) -> Option<u64> {
        let (id, properties_changed) = {
            let mut inner = self.inner.write();
            inner.files.get(&file_id)?;
            let properties_changed = inner.catalog.observe(&event);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.items.push(Arc::new(LogItem::new(id, file_id, event)));
            (id, properties_changed)
        };

        self.contexts.invalidate_all();
        if properties_changed {
            self.notify(StoreEvent::PropertiesChanged);
        }
        Some(id)
    }

    /// Import events from a file
    ///
    /// Streams events from `importer` starting at `start_offset` and appends
    /// those inside `range`; events outside it are dropped silently. The file's
    /// committed offset only ever covers events that were fully processed, so
    /// a cancelled or failed import can resume from it. Cancellation is checked
    /// at each event boundary and still commits what was read before it.
    pub async fn import(
        &self,
        importer: &dyn Importer,
        path: &Path,
        start_offset: u64,
        range: TimeRange,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ImportSummary> {
        let _guard = ImportGuard::acquire(&self.importing)?;

        let start_offset = if start_offset > 0 && !importer.supports_resume() {
            warn!(path = %path.display(), start_offset, "Importer cannot resume, reading from start");
            0
        } else {
            start_offset
        };

        let size = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| EngineError::Import(e.into()))?;

        let file_id = self.register_file(path);
        if let Some(file) = self.inner.write().file_mut(file_id) {
            file.size = size;
            file.import_cancelled = false;
        }

        let name = file_name(path);
        progress.start_file(&name, size, start_offset);
        info!(path = %path.display(), %file_id, start_offset, "Importing log file");

        let mut batch = PendingBatch {
            file_id,
            events: Vec::with_capacity(BATCH_FLUSH_SIZE),
            processed_offset: start_offset,
            committed_offset: start_offset,
            imported: 0,
            skipped: 0,
            properties_changed: false,
        };

        let stream = importer.import_logs(path, start_offset, cancel.clone());
        let result = self
            .drain(stream, &mut batch, range, progress, cancel)
            .await;

        // Whatever happened, keep what was fully read
        self.commit(&mut batch);
        if batch.properties_changed {
            self.notify(StoreEvent::PropertiesChanged);
        }

        match result {
            Ok(()) => {
                info!(
                    %file_id,
                    imported = batch.imported,
                    skipped = batch.skipped,
                    "Imported log file"
                );
                Ok(ImportSummary {
                    file_id,
                    imported: batch.imported,
                    skipped: batch.skipped,
                    offset: batch.committed_offset,
                })
            }
            Err(EngineError::ImportCancelled) => {
                if let Some(file) = self.inner.write().file_mut(file_id) {
                    file.import_cancelled = true;
                }
                info!(%file_id, offset = batch.committed_offset, "Import cancelled");
                Err(EngineError::ImportCancelled)
            }
            Err(e) => {
                warn!(%file_id, error = %e, "Import failed");
                Err(e)
            }
        }
    }

    async fn drain(
        &self,
        mut stream: ImportStream,
        batch: &mut PendingBatch,
        range: TimeRange,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::ImportCancelled),
                next = stream.next() => next,
            };

            let Some(next) = next else {
                break;
            };
            let imported = next?;

            if range.contains(imported.event.timestamp) {
                batch.events.push(imported.event);
            } else {
                batch.skipped += 1;
            }
            batch.processed_offset = imported.offset;
            progress.file_progress(imported.offset);

            if batch.events.len() >= BATCH_FLUSH_SIZE {
                self.commit(batch);
            }
        }

        // The importer may end its stream early when cancelled
        if cancel.is_cancelled() {
            return Err(EngineError::ImportCancelled);
        }
        Ok(())
    }

    /// Append pending events and advance the file's committed offset
    fn commit(&self, batch: &mut PendingBatch) {
        if batch.events.is_empty() && batch.processed_offset == batch.committed_offset {
            return;
        }

        let appended = batch.events.len();
        {
            let mut inner = self.inner.write();
            for event in batch.events.drain(..) {
                batch.properties_changed |= inner.catalog.observe(&event);
                let id = inner.next_id;
                inner.next_id += 1;
                inner.items.push(Arc::new(LogItem::new(id, batch.file_id, event)));
            }
            if let Some(file) = inner.file_mut(batch.file_id) {
                file.imported_offset = batch.processed_offset;
            }
        }
        batch.imported += appended;
        batch.committed_offset = batch.processed_offset;

        if appended > 0 {
            self.contexts.invalidate_all();
        }
    }

    /// Remove a file and all of its items
    ///
    /// Remaining items keep their ids. Returns false if the file is unknown.
    pub fn unload(&self, file_id: FileId) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            if inner.files.remove(&file_id).is_none() {
                return false;
            }
            let before = inner.items.len();
            inner.items.retain(|item| item.file_id != file_id);
            before - inner.items.len()
        };

        self.contexts.invalidate_all();
        self.notify(StoreEvent::FileUnloaded(file_id));
        debug!(%file_id, removed, "Unloaded log file");
        true
    }

    /// Drop all items, files and catalog entries
    ///
    /// The id counter keeps running, so ids are never reused.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write();
            inner.items.clear();
            inner.files.clear();
            inner.catalog.clear();
        }

        self.contexts.invalidate_all();
        self.notify(StoreEvent::PropertiesChanged);
        self.notify(StoreEvent::Cleared);
        debug!("Cleared log store");
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}
