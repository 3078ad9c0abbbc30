//! Durable storage of the session snapshot
//! The snapshot is kept as pretty JSON and replaced atomically, so a crash
//! mid-save leaves the previous snapshot in place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::fs;

use crate::core::manager_state::{ManagerState, RawState};
use crate::utils::write_atomic;

const STATE_FILE_NAME: &str = "state.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by `state.json` in `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty snapshot. An unreadable one is an error,
    /// since starting empty would forget the bound sensor and a latched fault.
    pub async fn load(&self) -> Result<ManagerState> {
        if !self.path.exists() {
            info!("No saved sensor state at {:?}", self.path);
            return Ok(ManagerState::default());
        }
        let json = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let raw: RawState = serde_json::from_str(&json)
            .with_context(|| format!("Sensor state at {:?} is not valid JSON", self.path))?;
        info!("Sensor state loaded from {:?}", self.path);
        Ok(ManagerState::from_raw(&raw))
    }

    pub async fn save(&self, state: &ManagerState) -> Result<()> {
        let json = serde_json::to_string_pretty(&state.to_raw())?;
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!("Sensor state saved to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    use crate::core::bluetooth::types::TransmitterIdentity;

    #[tokio::test]
    async fn missing_file_is_an_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load().await.unwrap(), ManagerState::default());
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("data"));
        let state = ManagerState {
            sensor_id: Some(TransmitterIdentity::new("DXCMA1")),
            activated_at: DateTime::from_timestamp(1_700_000_000, 0),
            last_connect: DateTime::from_timestamp(1_700_000_600, 0),
            ..ManagerState::default()
        };

        store.save(&state).await.unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path(), "not json").await.unwrap();

        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn interrupted_save_keeps_the_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let failed = ManagerState {
            sensor_id: Some(TransmitterIdentity::new("DXCMA1")),
            failed_at: DateTime::from_timestamp(1_700_003_600, 0),
            ..ManagerState::default()
        };
        store.save(&failed).await.unwrap();

        // what a crash halfway through the next save leaves behind
        fs::write(dir.path().join("state.json.tmp"), "{\n  \"sensorID\": {\"Str")
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, failed);
        assert!(loaded.is_failed());

        store.save(&ManagerState::default()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), ManagerState::default());
        assert!(!dir.path().join("state.json.tmp").exists());
    }
}
