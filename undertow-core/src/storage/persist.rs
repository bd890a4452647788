//! JSON state files written atomically under the download directory.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use super::StorageError;
use crate::torrent::InfoHash;

const STATE_DIR_NAME: &str = ".undertow";

/// Location of engine bookkeeping below a download directory.
#[derive(Debug, Clone)]
pub(crate) struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(download_dir: &Path) -> Self {
        Self {
            root: download_dir.join(STATE_DIR_NAME),
        }
    }

    pub fn cache_table(&self) -> PathBuf {
        self.root.join("cache.json")
    }

    pub fn bitmap(&self, info_hash: InfoHash) -> PathBuf {
        self.root.join("bitmaps").join(format!("{}.json", info_hash.to_hex()))
    }
}

/// Serializes `value` to `path` via a temp file and rename.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let encoded = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::disk_write(parent, e))?;
    }

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &encoded)
        .await
        .map_err(|e| StorageError::disk_write(&temp_path, e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| StorageError::disk_write(path, e))
}

/// Loads `path`, returning `None` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Removes `path`, treating a missing file as already removed.
pub(crate) async fn remove_file(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_json_then_read_returns_value() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(temp_dir.path());
        let path = state.bitmap(InfoHash::new([9; 20]));

        write_json(&path, &vec![1u32, 2, 3]).await.unwrap();
        let loaded: Option<Vec<u32>> = read_json(&path).await.unwrap();

        assert_eq!(loaded, Some(vec![1, 2, 3]));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_json_missing_file_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<u32>> = read_json(&temp_dir.path().join("nope.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
        remove_file(&temp_dir.path().join("nope.json")).await.unwrap();
    }
}
