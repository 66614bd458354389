//! File-per-key storage under the user's data directory

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::storage::{KeyValueStore, StorageError};

/// Stores each key as a file with mode 0600 inside a 0700 directory.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Open the store in the platform data directory (`~/.local/share/crawl-agent` on Linux)
    pub fn open_default() -> Result<Self, StorageError> {
        let base_dir = dirs::data_local_dir()
            .ok_or_else(|| StorageError::Backend("Could not determine data directory".to_string()))?
            .join("crawl-agent");
        Self::open(base_dir)
    }

    /// Open the store in an explicit directory, creating it if needed
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&base_dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys never escape the base directory
        let safe_key = key.replace(['/', '\\', '.'], "_");
        self.base_dir.join(safe_key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)?;
        let value = String::from_utf8(bytes).map_err(|_| StorageError::Encoding(key.to_string()))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.key_path(key);
        let mut file = File::create(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
