//! Filesystem-backed local store.
//!
//! One `<key>.json` file per key under the data directory:
//! ```text
//! <DATA_DIR>/
//!   clubs.json
//!   sessions.json
//!   tombstones.json
//!   ...
//! ```
//!
//! Writes go to a temp file first and are renamed into place, so a reader
//! never observes a partially written entry.

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use tokio::fs;

use rollcall_core::store::{LocalStore, StoreError};

fn io_error(path: &std::path::Path, err: io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), err))
}

/// [`LocalStore`] persisted as JSON files in a directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    data_dir: PathBuf,
}

impl FsStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Rejects keys that would escape the data directory.
    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(StoreError::Io(format!("invalid store key: {key:?}")));
        }
        Ok(())
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl LocalStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Self::validate_key(key)?;
        let path = self.key_path(key);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };

        let value = serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        Self::validate_key(key)?;
        let path = self.key_path(key);

        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|err| io_error(&self.data_dir, err))?;

        let bytes = serde_json::to_vec(&value).map_err(|err| StoreError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        })?;

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| io_error(&temp_path, err))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|err| io_error(&path, err))?;

        debug!("wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        Self::validate_key(key)?;
        let path = self.key_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}
