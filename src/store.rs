use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::lock::{LockSettings, StoreLockGuard};
use crate::task::TaskSnapshot;

/// Handle to the persisted Task Store. Every mutation goes through
/// [`TaskStore::transaction`]: lock, load, modify in memory, commit, unlock.
#[derive(Debug, Clone)]
pub(crate) struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: LockSettings,
}

impl TaskStore {
    pub(crate) fn new(path: impl Into<PathBuf>, lock: LockSettings) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current snapshot without taking the lock. Safe because commits
    /// replace the file atomically.
    pub(crate) fn load(&self) -> Result<TaskSnapshot, StoreError> {
        read_json(&self.path)
    }

    /// Runs `mutate` against a freshly loaded snapshot while holding the store
    /// lock and commits the result. Nothing is written if `mutate` fails or
    /// leaves the snapshot unchanged. The guard is handed to `mutate` so that
    /// History Store appends can prove they run under the same lock.
    pub(crate) fn transaction<T, E, F>(&self, mutate: F) -> Result<T, E>
    where
        F: FnOnce(&mut TaskSnapshot, &StoreLockGuard) -> Result<T, E>,
        E: From<StoreError>,
    {
        let guard = StoreLockGuard::acquire(&self.lock_path, &self.lock)?;
        let mut snapshot = self.load()?;
        let before = snapshot.clone();
        let result = mutate(&mut snapshot, &guard)?;
        if snapshot != before {
            self.commit(&snapshot, &guard)?;
        }
        drop(guard);
        Ok(result)
    }

    /// Atomically replaces the whole persisted snapshot.
    pub(crate) fn commit(
        &self,
        snapshot: &TaskSnapshot,
        _guard: &StoreLockGuard,
    ) -> Result<(), StoreError> {
        write_json_atomic(&self.path, snapshot)
    }
}

/// A missing or blank file reads as the default value; anything else that fails
/// to parse is reported as corruption with the JSON path of the failure.
pub(crate) fn read_json<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    if bytes.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|err| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("{} (at {})", err.inner(), err.path()),
    })
}

/// Writes `value` to a temp file in the target directory, syncs it, then renames
/// it over `path`. Readers observe either the previous or the new content.
pub(crate) fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;

    let mut temp = NamedTempFile::new_in(&dir).map_err(|err| StoreError::io(&dir, err))?;
    serde_json::to_writer_pretty(&mut temp, value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    temp.write_all(b"\n")
        .map_err(|err| StoreError::io(temp.path(), err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| StoreError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    Ok(())
}
