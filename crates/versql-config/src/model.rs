use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use versql_common::Migration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upgrade path, in ascending version order.
    #[serde(default)]
    pub migrations: Vec<Migration>,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Used when `--log-level` is not given.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            migrations: Vec::new(),
            data_dir: None,
            log_level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Target schema version; the highest migration version when unset.
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: None,
            in_memory: false,
        }
    }
}

fn default_name() -> String {
    "main".to_string()
}
