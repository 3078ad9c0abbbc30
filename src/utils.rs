//! Filesystem helpers shared by the config and state files.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TEMP_SUFFIX: &str = ".tmp";

/// Replaces `path` with `contents` through a sibling temporary file, so the
/// file on disk is always either the old or the new version. Missing parent
/// directories are created.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory at {:?}", parent))?;
            info!("Created directory at: {:?}", parent);
        }
    }

    let temp = temp_path(path);
    if let Err(e) = write_and_sync(&temp, contents).await {
        if let Err(cleanup) = fs::remove_file(&temp).await {
            warn!("Could not remove {:?}: {}", temp, cleanup);
        }
        return Err(e).with_context(|| format!("Failed to write {:?}", temp));
    }
    fs::rename(&temp, path)
        .await
        .with_context(|| format!("Failed to replace {:?}", path))
}

async fn write_and_sync(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

/// `state.json` -> `state.json.tmp`
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_the_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn stale_temp_file_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(temp_path(&path), b"{\"trunc").await.unwrap();

        write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"{}");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn temp_file_sits_next_to_the_target() {
        assert_eq!(
            temp_path(Path::new("/data/state.json")),
            PathBuf::from("/data/state.json.tmp")
        );
    }
}
