//! Importer registry
//!
//! Import sources name an importer profile; a profile names the importer
//! that reads the files and the default file pattern for new sources.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use logscope_logs::{CLEF_IMPORTER_ID, ClefImporter, Importer};

use crate::error::{Result, SessionError};

/// Named importer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImporterProfile {
    pub id: String,
    pub name: String,
    pub importer_id: String,
    pub default_source_filter: String,
    #[serde(default)]
    pub is_base_profile: bool,
}

/// Registered importers and importer profiles
pub struct ImporterRegistry {
    importers: HashMap<String, Arc<dyn Importer>>,
    profiles: BTreeMap<String, ImporterProfile>,
}

impl ImporterRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            importers: HashMap::new(),
            profiles: BTreeMap::new(),
        }
    }

    /// A registry with the built-in CLEF importer and its base profile
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_importer(CLEF_IMPORTER_ID, Arc::new(ClefImporter));
        registry.add_profile(ImporterProfile {
            id: CLEF_IMPORTER_ID.to_string(),
            name: CLEF_IMPORTER_ID.to_string(),
            importer_id: CLEF_IMPORTER_ID.to_string(),
            default_source_filter: "*.clef".to_string(),
            is_base_profile: true,
        });
        registry
    }

    pub fn register_importer(&mut self, id: impl Into<String>, importer: Arc<dyn Importer>) {
        self.importers.insert(id.into(), importer);
    }

    /// Add or replace a profile
    pub fn add_profile(&mut self, profile: ImporterProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, id: &str) -> Option<&ImporterProfile> {
        self.profiles.get(id)
    }

    /// Profiles ordered by id
    pub fn profiles(&self) -> impl Iterator<Item = &ImporterProfile> {
        self.profiles.values()
    }

    pub fn importer(&self, id: &str) -> Option<Arc<dyn Importer>> {
        self.importers.get(id).cloned()
    }

    /// Importer for a profile id
    pub fn resolve(&self, profile_id: &str) -> Result<Arc<dyn Importer>> {
        let profile = self
            .profile(profile_id)
            .ok_or_else(|| SessionError::UnknownImporterProfile(profile_id.to_string()))?;
        self.importer(&profile.importer_id)
            .ok_or_else(|| SessionError::UnknownImporter(profile.importer_id.clone()))
    }
}

impl Default for ImporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_clef_profile() {
        let registry = ImporterRegistry::new();
        let profile = registry.profile("CLEF").unwrap();
        assert_eq!(profile.default_source_filter, "*.clef");
        assert!(profile.is_base_profile);
        assert!(registry.resolve("CLEF").unwrap().supports_resume());
    }

    #[test]
    fn test_unknown_ids() {
        let mut registry = ImporterRegistry::new();
        assert!(matches!(
            registry.resolve("JSON"),
            Err(SessionError::UnknownImporterProfile(id)) if id == "JSON"
        ));

        registry.add_profile(ImporterProfile {
            id: "custom".into(),
            name: "Custom".into(),
            importer_id: "missing".into(),
            default_source_filter: "*.log".into(),
            is_base_profile: false,
        });
        assert!(matches!(
            registry.resolve("custom"),
            Err(SessionError::UnknownImporter(id)) if id == "missing"
        ));
        assert_eq!(registry.profiles().count(), 2);
    }
}
