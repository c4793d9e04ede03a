//! Session configuration and its persistence
//!
//! The configuration holds the import sources, the import time range and the
//! filter settings profiles. It is stored as camelCase JSON in the session's
//! data directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use logscope_logs::{FilterTree, TimeRange};

use crate::error::Result;

/// File name of the session config inside the data directory
pub const CONFIG_FILE_NAME: &str = "session-config.json";

/// A set of files imported with one importer profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSource {
    pub name: String,

    pub importer_profile_id: String,

    /// File path pattern; a glob when `import_all_files` is set
    pub filter: String,

    #[serde(default)]
    pub import_all_files: bool,

    /// Files to import, filled from `filter` on each import when `import_all_files` is set
    #[serde(default)]
    pub selected_files: Vec<PathBuf>,
}

impl ImportSource {
    /// A source importing every file matching `filter`
    pub fn glob(name: impl Into<String>, profile_id: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            importer_profile_id: profile_id.into(),
            filter: filter.into(),
            import_all_files: true,
            selected_files: Vec::new(),
        }
    }

    /// A source importing an explicit list of files
    pub fn files(name: impl Into<String>, profile_id: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            importer_profile_id: profile_id.into(),
            filter: String::new(),
            import_all_files: false,
            selected_files: files,
        }
    }
}

/// Grouping properties and encoded layer overrides of one settings profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSettings {
    #[serde(default)]
    pub properties: Vec<String>,

    /// Value path (pipe-joined) to encoded layer flags
    #[serde(default)]
    pub layers_settings: BTreeMap<String, String>,
}

/// Persistent session configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub sources: Vec<ImportSource>,

    /// Events before this instant are not imported
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// Events after this instant are not imported
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Filter settings per profile id; the default profile is ""
    #[serde(default)]
    pub filter_settings: BTreeMap<String, FilterSettings>,
}

fn profile_key(profile: Option<&str>) -> String {
    profile.unwrap_or_default().to_string()
}

impl SessionConfig {
    pub fn time_range(&self) -> TimeRange {
        TimeRange::between(self.start_time, self.end_time)
    }

    /// Add a source unless one with the same profile and filter is already
    /// present; returns whether it was added
    pub fn add_source(&mut self, source: ImportSource) -> bool {
        let duplicate = self.sources.iter().any(|s| {
            s.importer_profile_id == source.importer_profile_id
                && s.import_all_files == source.import_all_files
                && s.filter == source.filter
                && (s.import_all_files || s.selected_files == source.selected_files)
        });
        if !duplicate {
            self.sources.push(source);
        }
        !duplicate
    }

    /// Store the tree's non-default layers under a profile
    ///
    /// A new profile also records the tree's grouping properties; an
    /// existing one keeps its properties and has its layers replaced.
    pub fn write_layer_settings(&mut self, tree: &FilterTree, profile: Option<&str>) {
        let settings = self
            .filter_settings
            .entry(profile_key(profile))
            .or_insert_with(|| FilterSettings {
                properties: tree.layer_properties().to_vec(),
                layers_settings: BTreeMap::new(),
            });
        settings.layers_settings = tree.encode_layers();
    }

    /// Grouping properties of a profile, empty if the profile does not exist
    pub fn property_settings(&self, profile: Option<&str>) -> Vec<String> {
        self.filter_settings
            .get(&profile_key(profile))
            .map(|s| s.properties.clone())
            .unwrap_or_default()
    }

    /// Set the grouping properties of a profile
    ///
    /// Changing the grouping invalidates the value paths, so stored layers
    /// of an existing profile are dropped.
    pub fn write_property_settings(&mut self, properties: Vec<String>, profile: Option<&str>) {
        let settings = self.filter_settings.entry(profile_key(profile)).or_default();
        settings.properties = properties;
        settings.layers_settings.clear();
    }

    /// Set the tree's grouping properties from a profile (none if missing)
    pub fn apply_property_settings(&self, tree: &mut FilterTree, profile: Option<&str>) {
        tree.set_layer_properties(self.property_settings(profile));
    }

    /// Restore layer flags of a profile onto the tree
    pub fn apply_layer_settings(&self, tree: &mut FilterTree, profile: Option<&str>) {
        if let Some(settings) = self.filter_settings.get(&profile_key(profile)) {
            tree.apply_layers(&settings.layers_settings);
        }
    }
}

/// Storage for a session's configuration
#[async_trait]
pub trait ConfigStorage: Send + Sync {
    async fn read_config(&self, session_dir: &Path, data_dir: &Path) -> Result<SessionConfig>;

    async fn write_config(&self, config: &SessionConfig, session_dir: &Path, data_dir: &Path) -> Result<()>;
}

/// Stores the configuration as pretty JSON in the data directory
#[derive(Clone, Copy, Debug, Default)]
pub struct FileConfigStorage;

impl FileConfigStorage {
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE_NAME)
    }
}

#[async_trait]
impl ConfigStorage for FileConfigStorage {
    async fn read_config(&self, _session_dir: &Path, data_dir: &Path) -> Result<SessionConfig> {
        let content = tokio::fs::read_to_string(Self::config_path(data_dir)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_config(&self, config: &SessionConfig, _session_dir: &Path, data_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        tokio::fs::write(Self::config_path(data_dir), content).await?;
        Ok(())
    }
}

/// Keeps the configuration in memory; a fresh storage reads as default
#[derive(Debug, Default)]
pub struct MemoryConfigStorage {
    config: Mutex<Option<SessionConfig>>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written configuration
    pub fn snapshot(&self) -> Option<SessionConfig> {
        self.config.lock().clone()
    }
}

#[async_trait]
impl ConfigStorage for MemoryConfigStorage {
    async fn read_config(&self, _session_dir: &Path, _data_dir: &Path) -> Result<SessionConfig> {
        Ok(self.config.lock().clone().unwrap_or_default())
    }

    async fn write_config(&self, config: &SessionConfig, _session_dir: &Path, _data_dir: &Path) -> Result<()> {
        *self.config.lock() = Some(config.clone());
        Ok(())
    }
}

/// Contents of the `.session.logscope` file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_data_storage_id: String,
}

impl SessionInfo {
    pub async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }
}
