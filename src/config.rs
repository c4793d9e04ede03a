//! Application settings for the logscope CLI
//!
//! Read from an optional `logscope.toml`, either given with `--config` or
//! found in the session directory. Command line flags override it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use logscope_session::{ImporterProfile, ImporterRegistry};

/// File looked up in the session directory when no `--config` is given
pub const APP_CONFIG_FILE_NAME: &str = "logscope.toml";

/// Page size when neither the flag nor the config sets one
const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    /// Grouping properties for new sessions
    pub group_by: Vec<String>,

    pub page_size: Option<usize>,

    /// Extra profiles on top of the built-in CLEF profile
    #[serde(rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

/// An importer profile entry, `[[profile]]` in the config file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProfileConfig {
    pub id: String,
    pub name: Option<String>,
    pub importer: String,
    pub filter: String,
}

impl AppConfig {
    /// Load the config from an explicit path, or from the session directory if present
    pub fn load(explicit: Option<&Path>, session_dir: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = session_dir.join(APP_CONFIG_FILE_NAME);
                if !path.is_file() {
                    return Ok(Self::default());
                }
                path
            }
        };
        Self::from_file(&path)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// The built-in importers plus the configured profiles
    pub fn importer_registry(&self) -> ImporterRegistry {
        let mut registry = ImporterRegistry::new();
        for profile in &self.profiles {
            registry.add_profile(ImporterProfile {
                id: profile.id.clone(),
                name: profile.name.clone().unwrap_or_else(|| profile.id.clone()),
                importer_id: profile.importer.clone(),
                default_source_filter: profile.filter.clone(),
                is_base_profile: false,
            });
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: AppConfig = toml::from_str(
            r#"
            group-by = ["App", "Host"]
            page-size = 20

            [[profile]]
            id = "service"
            importer = "CLEF"
            filter = "service-*.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.group_by, vec!["App", "Host"]);
        assert_eq!(config.page_size(), 20);

        let registry = config.importer_registry();
        let profile = registry.profile("service").unwrap();
        assert_eq!(profile.name, "service");
        assert_eq!(profile.default_source_filter, "service-*.json");
        assert!(registry.resolve("service").is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(None, dir.path()).unwrap();
        assert!(config.group_by.is_empty());
        assert_eq!(config.page_size(), DEFAULT_PAGE_SIZE);
        assert!(AppConfig::load(Some(&dir.path().join("nope.toml")), dir.path()).is_err());
    }
}
