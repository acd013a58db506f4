use crate::{
    error::QueryDepsError,
    properties::{
        PropertyKey, PROP_DISPLAY_TITLE, PROP_ERROR, PROP_LAST_EDITOR, PROP_MODIFICATION_DATE,
        PROP_QUERY_DEPTH, PROP_QUERY_DURATION, PROP_QUERY_FORMAT, PROP_QUERY_PARAMETERS,
        PROP_QUERY_SIZE, PROP_QUERY_SOURCE, PROP_QUERY_STATUS, PROP_REDIRECT, PROP_SORT_KEY,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{read_to_string, write},
    path::PathBuf,
    time::Duration,
};

/// Name of the table holding [DependencyConfig] inside a TOML config file.
pub const CONFIG_TABLE: &str = "dependencies";

/// Settings of the dependency tracking engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Master switch. When off no dependency edges are written.
    pub enabled: bool,
    /// Window after an owner was touched during which re-registering its edges is skipped.
    pub skew_factor_secs: u64,
    /// Whether [crate::staleness::StalenessValidator] runs at all.
    pub check_archaic: bool,
    /// Properties that never count as dependency triggers.
    pub exemptions: BTreeSet<PropertyKey>,
    /// Properties whose change still triggers their subject, even when exempted.
    pub affiliates: BTreeSet<PropertyKey>,
    /// Route disposals through the deferred worker instead of deleting inline.
    pub dispose_deferred: bool,
    /// Lifetime of [crate::journal::UpdateJournal] markers.
    pub journal_ttl_secs: u64,
    /// Default page size of backlink lookups.
    pub backlinks_limit: usize,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        let exemptions = [
            PROP_MODIFICATION_DATE,
            PROP_SORT_KEY,
            PROP_LAST_EDITOR,
            PROP_QUERY_DURATION,
            PROP_QUERY_SIZE,
            PROP_QUERY_DEPTH,
            PROP_QUERY_FORMAT,
            PROP_QUERY_SOURCE,
            PROP_QUERY_STATUS,
            PROP_QUERY_PARAMETERS,
            PROP_REDIRECT,
            PROP_ERROR,
            PROP_DISPLAY_TITLE,
        ];
        DependencyConfig {
            enabled: true,
            skew_factor_secs: 10,
            check_archaic: true,
            exemptions: exemptions.into_iter().map(PropertyKey::new).collect(),
            affiliates: BTreeSet::from([PropertyKey::new(PROP_DISPLAY_TITLE)]),
            dispose_deferred: true,
            journal_ttl_secs: 60,
            backlinks_limit: 50,
        }
    }
}

impl DependencyConfig {
    pub fn skew_window(&self) -> Duration {
        Duration::from_secs(self.skew_factor_secs)
    }

    pub fn journal_ttl(&self) -> Duration {
        Duration::from_secs(self.journal_ttl_secs)
    }

    pub fn is_exempted(&self, key: &PropertyKey) -> bool {
        self.exemptions.contains(key)
    }

    pub fn is_affiliate(&self, key: &PropertyKey) -> bool {
        self.affiliates.contains(key)
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<DependencyConfig, QueryDepsError>;
    fn set_config(&self, config: &DependencyConfig) -> Result<(), QueryDepsError>;
}

/// Reads and writes the `[dependencies]` table of a TOML file.
#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<DependencyConfig, QueryDepsError> {
        tracing::debug!("Attempting to read dependency config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(DependencyConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let mut config: BTreeMap<String, DependencyConfig> = toml::from_str(&content)?;
        Ok(config.remove(CONFIG_TABLE).unwrap_or_default())
    }

    fn set_config(&self, config: &DependencyConfig) -> Result<(), QueryDepsError> {
        tracing::debug!("Attempting to write dependency config to: {:?}", &self.path);
        let mut table = BTreeMap::new();
        table.insert(CONFIG_TABLE.to_string(), config);
        let toml_string = toml::to_string(&table)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
