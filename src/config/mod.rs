pub mod sensor_config;
pub mod session_config;

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use directories::ProjectDirs;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use sensor_config::SensorConfig;
pub use session_config::SessionConfig;

use crate::utils::write_atomic;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default log filter. `RUST_LOG` takes precedence.
    pub log_level: String,
    pub session: SessionConfig,
    pub sensor: SensorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: "info".to_string(),
            session: SessionConfig::default(),
            sensor: SensorConfig::default(),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "g7-cgm-bridge").ok_or_else(|| anyhow!("No home directory found"))
}

/// Platform config directory, e.g. `~/.config/g7-cgm-bridge` on Linux.
pub fn default_config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Platform data directory, where the session snapshot is kept.
pub fn default_data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

impl AppConfig {
    /// Loads the config from `config_dir`, falling back to defaults when the
    /// file does not exist.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        write_atomic(&file_path, config_json.as_bytes()).await?;

        info!("Config saved to {:?}.", file_path_str);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::BindPolicy;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let mut config = AppConfig::default();
        config.log_level = "debug".into();
        config.session.bind_policy = BindPolicy::RequireStored;
        config.sensor.warmup_minutes = 30;

        config.save_config(&nested).await.unwrap();
        assert_eq!(AppConfig::load_config(&nested).await.unwrap(), config);
    }

    #[tokio::test]
    async fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "session": { "bind_policy": "require_stored", "max_retries": 2 } }"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config.session.bind_policy, BindPolicy::RequireStored);
        assert_eq!(config.session.max_retries, 2);
        assert!(config.session.authenticate);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sensor, SensorConfig::default());
    }
}
