//! Log session: a directory with import sources, a config and loaded data
//!
//! A session owns the event store and the filter tree. Importing drives all
//! source files through their importers, oldest file first, then rebuilds the
//! filter tree and restores the persisted layer settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logscope_logs::{
    ContextId, EngineError, Expr, FilterTree, ImportProgress, ImportSummary, Importer, LogStore,
    ProgressData, ProgressReporter, QueryPage, QueryRequest, parse_filter, parse_sort,
};

use crate::config::{ConfigStorage, FileConfigStorage, SessionConfig, SessionInfo};
use crate::error::{Result, SessionError};
use crate::importers::ImporterRegistry;
use crate::sources::expand_source;

/// Hidden directory inside the session directory holding session data
pub const DATA_DIRECTORY_NAME: &str = ".logscope";

/// Marker file identifying a session directory
pub const SESSION_INFO_FILE_NAME: &str = ".session.logscope";

/// The only supported data storage backend
pub const IN_MEMORY_STORAGE_ID: &str = "InMemory";

const IMPORT_ACTION: &str = "Importing log files";
const BUILD_TREE_ACTION: &str = "Build filter tree";

/// Notifications for views of a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Filters changed or new data arrived; views should reload their page
    Refresh,
    ImportStarted,
    ImportFinished,
}

/// Page request in the textual query surface
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub skip: usize,
    pub take: Option<usize>,
    /// `field [asc|desc]`, ascending timestamp if absent
    pub sort: Option<String>,
    /// Additional per-call filter, combined with the session's filters
    pub filter: Option<String>,
}

impl PageRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Outcome of one file of an import run
#[derive(Debug)]
pub struct FileImport {
    pub path: PathBuf,
    pub result: std::result::Result<ImportSummary, EngineError>,
}

/// Outcome of an import run
///
/// A failing file does not stop the run; its error is kept here and the
/// events read before the failure stay in the store.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub files: Vec<FileImport>,
}

impl ImportReport {
    /// Events appended over all files
    pub fn imported(&self) -> usize {
        self.files
            .iter()
            .filter_map(|f| f.result.as_ref().ok())
            .map(|s| s.imported)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileImport> {
        self.files.iter().filter(|f| f.result.is_err())
    }
}

/// A file scheduled for import
struct PlannedFile {
    path: PathBuf,
    importer: Arc<dyn Importer>,
    modified: SystemTime,
    size: u64,
}

/// An open log session
pub struct LogSession {
    session_dir: PathBuf,
    store: LogStore,
    importers: Arc<ImporterRegistry>,
    config_storage: Arc<dyn ConfigStorage>,
    config: Mutex<SessionConfig>,
    tree: Mutex<FilterTree>,
    /// False while the stored layer settings are not yet applied to the tree
    tree_synced: AtomicBool,
    /// Parsed advanced filter and its source text
    advanced_filter: Mutex<Option<(String, Expr)>>,
    /// Held for the duration of an import
    import_lock: tokio::sync::Mutex<()>,
    import_cancel: Mutex<Option<CancellationToken>>,
    progress: ProgressReporter,
    events: broadcast::Sender<SessionEvent>,
}

impl LogSession {
    /// Create a new session in an existing directory
    pub async fn create(dir: impl AsRef<Path>, storage_id: &str) -> Result<Self> {
        Self::create_with(
            dir,
            storage_id,
            Arc::new(ImporterRegistry::new()),
            Arc::new(FileConfigStorage),
        )
        .await
    }

    pub async fn create_with(
        dir: impl AsRef<Path>,
        storage_id: &str,
        importers: Arc<ImporterRegistry>,
        config_storage: Arc<dyn ConfigStorage>,
    ) -> Result<Self> {
        check_storage_id(storage_id)?;

        let session = Self::new(dir.as_ref(), importers, config_storage, SessionConfig::default());
        session.ensure_directories().await?;
        SessionInfo {
            session_data_storage_id: storage_id.to_string(),
        }
        .write(&session.info_file_path())
        .await?;
        session.save().await?;

        info!(dir = %session.session_dir.display(), "Created session");
        Ok(session)
    }

    /// Open an existing session
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(dir, Arc::new(ImporterRegistry::new()), Arc::new(FileConfigStorage)).await
    }

    pub async fn open_with(
        dir: impl AsRef<Path>,
        importers: Arc<ImporterRegistry>,
        config_storage: Arc<dyn ConfigStorage>,
    ) -> Result<Self> {
        let session = Self::new(dir.as_ref(), importers, config_storage, SessionConfig::default());
        let info_path = session.info_file_path();
        if !tokio::fs::try_exists(&info_path).await? {
            return Err(SessionError::SessionNotFound(info_path));
        }
        session.ensure_directories().await?;

        let info = SessionInfo::read(&info_path).await?;
        check_storage_id(&info.session_data_storage_id)?;

        let config = session
            .config_storage
            .read_config(&session.session_dir, &session.data_dir())
            .await?;
        config.apply_property_settings(&mut session.tree.lock(), None);
        *session.config.lock() = config;
        session.tree_synced.store(false, Ordering::SeqCst);

        info!(dir = %session.session_dir.display(), "Opened session");
        Ok(session)
    }

    /// Whether a directory holds a session
    pub async fn exists(dir: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(dir.as_ref().join(SESSION_INFO_FILE_NAME))
            .await
            .unwrap_or(false)
    }

    fn new(
        dir: &Path,
        importers: Arc<ImporterRegistry>,
        config_storage: Arc<dyn ConfigStorage>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session_dir: std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()),
            store: LogStore::new(),
            importers,
            config_storage,
            config: Mutex::new(config),
            tree: Mutex::new(FilterTree::new()),
            tree_synced: AtomicBool::new(true),
            advanced_filter: Mutex::new(None),
            import_lock: tokio::sync::Mutex::new(()),
            import_cancel: Mutex::new(None),
            progress: ProgressReporter::default(),
            events,
        }
    }

    async fn ensure_directories(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.session_dir).await? {
            return Err(SessionError::MissingDirectory(self.session_dir.clone()));
        }
        tokio::fs::create_dir_all(self.data_dir()).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.session_dir.join(DATA_DIRECTORY_NAME)
    }

    pub fn info_file_path(&self) -> PathBuf {
        self.session_dir.join(SESSION_INFO_FILE_NAME)
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn importers(&self) -> &ImporterRegistry {
        &self.importers
    }

    /// Snapshot of the configuration
    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    /// Run a closure against the filter tree without changing it
    pub fn with_filter_tree<R>(&self, f: impl FnOnce(&FilterTree) -> R) -> R {
        f(&self.tree.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn is_importing(&self) -> bool {
        self.import_lock.try_lock().is_err()
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Write the configuration, including the current layer settings
    ///
    /// Until the first import of an opened session rebuilds the tree, the
    /// stored layer settings are kept as they are.
    pub async fn save(&self) -> Result<()> {
        let config = {
            let mut config = self.config.lock();
            if self.tree_synced.load(Ordering::SeqCst) {
                config.write_layer_settings(&self.tree.lock(), None);
            }
            config.clone()
        };
        self.config_storage
            .write_config(&config, &self.session_dir, &self.data_dir())
            .await?;
        debug!(dir = %self.session_dir.display(), "Saved session config");
        Ok(())
    }

    /// Edit the configuration and save it
    pub async fn update_config(&self, f: impl FnOnce(&mut SessionConfig)) -> Result<()> {
        f(&mut self.config.lock());
        self.save().await
    }

    /// Change the grouping properties and rebuild the filter tree
    ///
    /// Layer overrides of the previous grouping are dropped.
    pub async fn set_grouping_properties(&self, properties: Vec<String>) -> Result<()> {
        {
            let mut config = self.config.lock();
            let mut tree = self.tree.lock();
            config.write_property_settings(properties.clone(), None);
            tree.set_layer_properties(properties);
            self.store.rebuild_filter_tree(&mut tree);
        }
        self.tree_synced.store(true, Ordering::SeqCst);
        self.notify(SessionEvent::Refresh);
        self.save().await
    }

    /// Edit the filter tree; any visibility change refreshes views and is saved
    pub async fn update_filter<R>(&self, f: impl FnOnce(&mut FilterTree) -> R) -> Result<R> {
        let (result, changed) = {
            let mut tree = self.tree.lock();
            let before = tree.revision();
            let result = tree.batch(f);
            (result, tree.revision() != before)
        };
        if changed {
            self.notify(SessionEvent::Refresh);
            self.save().await?;
        }
        Ok(result)
    }

    /// Set the free-form filter expression; blank clears it
    pub fn set_advanced_filter(&self, expression: Option<&str>) -> Result<()> {
        let text = expression.map(str::trim).filter(|e| !e.is_empty());
        {
            let mut current = self.advanced_filter.lock();
            if current.as_ref().map(|(t, _)| t.as_str()) == text {
                return Ok(());
            }
            *current = match text {
                Some(text) => parse_filter(text)?.map(|expr| (text.to_string(), expr)),
                None => None,
            };
        }
        self.notify(SessionEvent::Refresh);
        Ok(())
    }

    pub fn advanced_filter(&self) -> Option<String> {
        self.advanced_filter.lock().as_ref().map(|(t, _)| t.clone())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Filter tree, advanced filter and an optional per-call filter, AND-combined
    pub fn combined_filter(&self, extra: Option<&str>) -> Result<Option<Expr>> {
        let mut parts = Vec::new();
        parts.extend(self.tree.lock().compiled_filter());
        parts.extend(self.advanced_filter.lock().as_ref().map(|(_, e)| e.clone()));
        if let Some(extra) = extra {
            parts.extend(parse_filter(extra)?);
        }

        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(Expr::and(parts)))
    }

    /// Load one page through a view context
    pub fn load_page(&self, request: &PageRequest, context: ContextId, cancel: &CancellationToken) -> Result<QueryPage> {
        let filter = self.combined_filter(request.filter.as_deref())?;
        let sort = match request.sort.as_deref() {
            Some(sort) => parse_sort(sort)?,
            None => None,
        };
        if let Some(filter) = &filter {
            debug!(%filter, "Combined filter");
        }

        let query = QueryRequest {
            skip: request.skip,
            take: request.take,
            sort,
            filter,
        };
        Ok(self.store.query(&query, context, cancel)?)
    }

    // ------------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------------

    /// Import all source files
    ///
    /// Only one import runs at a time. Files already in the store are resumed
    /// from their committed offset when the importer supports it and imported
    /// again from scratch otherwise. A cancelled import keeps what it read and
    /// skips the filter tree rebuild.
    pub async fn import(&self) -> Result<ImportReport> {
        let _running = self
            .import_lock
            .try_lock()
            .map_err(|_| EngineError::ImportAlreadyRunning)?;

        let cancel = CancellationToken::new();
        *self.import_cancel.lock() = Some(cancel.clone());
        self.notify(SessionEvent::ImportStarted);

        let result = self.run_import(&cancel).await;

        *self.import_cancel.lock() = None;
        self.notify(SessionEvent::ImportFinished);
        result
    }

    /// Request cancellation of the running import, if any
    pub fn cancel_import(&self) {
        if let Some(cancel) = self.import_cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    /// Cancel and wait for any running import, then drop all loaded data
    pub async fn unload_data(&self) {
        self.cancel_import();
        let _running = self.import_lock.lock().await;
        self.store.clear();
        self.notify(SessionEvent::Refresh);
        info!(dir = %self.session_dir.display(), "Unloaded session data");
    }

    async fn run_import(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        self.progress.update(|p| {
            *p = ImportProgress {
                action: IMPORT_ACTION.to_string(),
                item: None,
                main: ProgressData::indeterminate(),
                secondary: None,
                can_cancel: true,
            }
        });

        let files = self.plan_files().await?;
        let total: u64 = files.iter().map(|f| f.size).sum();
        self.progress
            .update(|p| p.main = ProgressData::new(total as f64, 0.0));
        info!(files = files.len(), bytes = total, "Starting import");

        let range = self.config.lock().time_range();
        let mut report = ImportReport::default();

        for file in files {
            let start_offset = self.start_offset(&file);
            let result = self
                .store
                .import(
                    file.importer.as_ref(),
                    &file.path,
                    start_offset,
                    range,
                    &self.progress,
                    cancel,
                )
                .await;

            match result {
                Err(EngineError::ImportCancelled) => {
                    self.notify(SessionEvent::Refresh);
                    return Err(EngineError::ImportCancelled.into());
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Skipping file after import error");
                    report.files.push(FileImport {
                        path: file.path,
                        result: Err(e),
                    });
                }
                Ok(summary) => report.files.push(FileImport {
                    path: file.path,
                    result: Ok(summary),
                }),
            }
        }

        self.progress.update(|p| {
            p.action = BUILD_TREE_ACTION.to_string();
            p.item = None;
            p.main = ProgressData::indeterminate();
            p.secondary = None;
            p.can_cancel = false;
        });

        {
            let config = self.config.lock();
            let mut tree = self.tree.lock();
            config.apply_property_settings(&mut tree, None);
            // One notification for rebuild plus restore, and no save
            tree.batch(|tree| {
                self.store.rebuild_filter_tree(tree);
                config.apply_layer_settings(tree, None);
            });
        }
        self.tree_synced.store(true, Ordering::SeqCst);
        self.notify(SessionEvent::Refresh);

        info!(imported = report.imported(), failed = report.failures().count(), "Import finished");
        Ok(report)
    }

    /// Expand sources and order their files by last write time
    async fn plan_files(&self) -> Result<Vec<PlannedFile>> {
        let sources = self.config.lock().sources.clone();
        let mut planned = Vec::new();

        for (n, source) in sources.iter().enumerate() {
            let importer = self.importers.resolve(&source.importer_profile_id)?;
            let paths = expand_source(source, &self.session_dir).await?;

            for path in &paths {
                let metadata = tokio::fs::metadata(path).await?;
                planned.push(PlannedFile {
                    path: path.clone(),
                    importer: Arc::clone(&importer),
                    modified: metadata.modified()?,
                    size: metadata.len(),
                });
            }

            if source.import_all_files
                && let Some(stored) = self.config.lock().sources.get_mut(n)
            {
                stored.selected_files = paths;
            }
        }

        planned.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(planned)
    }

    /// Offset to continue a file from; unloads it when it must be read again
    fn start_offset(&self, file: &PlannedFile) -> u64 {
        let Some(existing) = self.store.file_by_path(&file.path) else {
            return 0;
        };
        // A file that shrank was replaced, not appended to
        if file.importer.supports_resume() && existing.imported_offset <= file.size {
            return existing.imported_offset;
        }
        self.store.unload(existing.id);
        0
    }
}

fn check_storage_id(storage_id: &str) -> Result<()> {
    if storage_id != IN_MEMORY_STORAGE_ID {
        return Err(EngineError::UnsupportedStorageBackend(storage_id.to_string()).into());
    }
    Ok(())
}
