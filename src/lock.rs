use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;

use crate::error::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub(crate) struct LockSettings {
    pub(crate) timeout: Duration,
    /// A lock file older than this is assumed to belong to a crashed holder.
    pub(crate) stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Exclusive advisory lock shared by every process that opens the same store.
/// Held while the guard lives. The lock file carries a per-acquire stamp and is
/// only removed on drop while it still holds that stamp.
#[derive(Debug)]
pub(crate) struct StoreLockGuard {
    path: PathBuf,
    stamp: String,
}

impl StoreLockGuard {
    pub(crate) fn acquire(path: &Path, settings: &LockSettings) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
        }

        let stamp = format!(
            "pid={} token={:016x} acquired={}\n",
            std::process::id(),
            rand::random::<u64>(),
            Utc::now().to_rfc3339()
        );
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(err) = file.write_all(stamp.as_bytes()).and_then(|()| file.sync_all()) {
                        let _ = fs::remove_file(path);
                        return Err(StoreError::io(path, err));
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        stamp,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    evict_stale_lock(path, settings.stale_after);
                    if started.elapsed() >= settings.timeout {
                        return Err(StoreError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(StoreError::io(path, err)),
            }
        }
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        // A peer may have evicted this lock as stale and taken its own.
        remove_lock_if(&self.path, |tombstone| {
            fs::read_to_string(tombstone).is_ok_and(|contents| contents == self.stamp)
        });
    }
}

fn evict_stale_lock(path: &Path, stale_after: Duration) {
    if !is_stale(path, stale_after) {
        return;
    }
    remove_lock_if(path, |tombstone| is_stale(tombstone, stale_after));
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// Moves the lock file aside atomically, then deletes it if `owned` accepts
/// what was moved. Otherwise the file is linked back into place, which fails
/// harmlessly when another lock was created in the meantime.
fn remove_lock_if<F>(path: &Path, owned: F)
where
    F: FnOnce(&Path) -> bool,
{
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".release-{:016x}", rand::random::<u64>()));
    let tombstone = path.with_file_name(name);
    if fs::rename(path, &tombstone).is_err() {
        return;
    }
    if !owned(&tombstone) {
        let _ = fs::hard_link(&tombstone, path);
    }
    let _ = fs::remove_file(&tombstone);
}
