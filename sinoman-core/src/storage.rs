//! Local key-value persistence for sessions and the offline queue.
//!
//! Writes are synchronous: when `set` returns, the value is durable. Nothing is persisted
//! fire-and-forget, so a process killed right after an enqueue does not lose the payment.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{SinomanError, SinomanResult};

/// Key-value store backing everything `sinoman-core` persists across restarts.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    fn get(&self, key: &str) -> SinomanResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    fn set(&self, key: &str, value: &str) -> SinomanResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    fn delete(&self, key: &str) -> SinomanResult<()>;
}

/// In-memory store. Nothing survives the process; useful for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().map(|values| values.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> SinomanError {
    SinomanError::Storage("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> SinomanResult<Option<String>> {
        Ok(self.values.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SinomanResult<()> {
        self.values
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> SinomanResult<()> {
        self.values.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }
}

/// File-backed store: one file per key inside a directory.
///
/// Writes go to a temporary file which is synced and then renamed over the target, so a reader
/// sees either the old value or the new one, never a partial write.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `directory`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(directory: impl AsRef<Path>) -> SinomanResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|err| {
            io_error(
                &format!("failed to create store directory '{}'", directory.display()),
                &err,
            )
        })?;
        Ok(Self { directory })
    }

    /// Directory holding the store's files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn value_path(&self, key: &str) -> SinomanResult<PathBuf> {
        validate_key(key)?;
        Ok(self.directory.join(key))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!(".{key}.tmp"))
    }

    fn sync_directory(&self) -> SinomanResult<()> {
        #[cfg(unix)]
        {
            File::open(&self.directory)
                .and_then(|dir| dir.sync_all())
                .map_err(|err| io_error("failed to sync store directory", &err))?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> SinomanResult<Option<String>> {
        let path = self.value_path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&format!("failed to read '{key}'"), &err)),
        }
    }

    fn set(&self, key: &str, value: &str) -> SinomanResult<()> {
        let path = self.value_path(key)?;
        let temp = self.temp_path(key);

        let mut file = File::create(&temp)
            .map_err(|err| io_error(&format!("failed to create temp file for '{key}'"), &err))?;
        file.write_all(value.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| io_error(&format!("failed to write '{key}'"), &err))?;
        drop(file);

        fs::rename(&temp, &path)
            .map_err(|err| io_error(&format!("failed to commit '{key}'"), &err))?;
        self.sync_directory()
    }

    fn delete(&self, key: &str) -> SinomanResult<()> {
        let path = self.value_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => self.sync_directory(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&format!("failed to delete '{key}'"), &err)),
        }
    }
}

/// Keys become file names, so only a conservative character set is accepted.
fn validate_key(key: &str) -> SinomanResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SinomanError::invalid_input(
            "key",
            format!("`{key}` is not a valid storage key"),
        ))
    }
}

fn io_error(context: &str, err: &std::io::Error) -> SinomanError {
    SinomanError::Storage(format!("{context}: {err}"))
}
