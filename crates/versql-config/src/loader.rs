use std::path::{Path, PathBuf};

use tracing::info;
use versql_common::{Error, Result};

use crate::model::AppConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".versql"));
        let xdg_config = dirs::config_dir().map(|c| c.join("versql"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                // XDG wins unless only the dot-directory exists.
                if !xdg.exists() && home.exists() {
                    home
                } else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".versql"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Directory holding the database files: `data_dir` from the config, or
    /// `<config_dir>/data`.
    pub fn data_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .data_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("data"))
    }

    pub fn load(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }

    pub fn ensure_dirs(&self, config: &AppConfig) -> Result<()> {
        for dir in [self.config_dir.clone(), self.data_dir(config)] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }
        }

        Ok(())
    }
}
