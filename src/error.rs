use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::task::TaskId;

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    /// The persisted snapshot exists but cannot be parsed. Never replaced with an empty store.
    #[error("corrupt store {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("timed out after {waited_ms}ms waiting for store lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("store io failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        match self {
            Self::Corrupt { path, .. }
            | Self::LockTimeout { path, .. }
            | Self::Io { path, .. }
            | Self::Serialize { path, .. } => path,
        }
    }

    pub(crate) fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    pub(crate) fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {}", failures.join("; "))]
pub(crate) struct NotificationDeliveryError {
    pub(crate) failures: Vec<String>,
}

impl NotificationDeliveryError {
    pub(crate) fn single(message: impl Into<String>) -> Self {
        Self {
            failures: vec![message.into()],
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum CommandExecutionError {
    #[error("failed to launch command '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
}

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),
}

#[derive(Debug, Error)]
pub(crate) enum AuthError {
    #[error("passkey file {} is unreadable: {detail}", path.display())]
    Unreadable { path: PathBuf, detail: String },

    #[error("failed to write passkey file {}: {detail}", path.display())]
    Write { path: PathBuf, detail: String },

    #[error("passkey must not be empty")]
    EmptySecret,

    #[error("access denied")]
    Denied,
}

#[derive(Debug, Error)]
pub(crate) enum EditorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("unrecognized time '{0}' (expected YYYY-MM-DD HH:MM, YYYY-MM-DD, HH:MM, H:MM AM or RFC 3339)")]
    InvalidTime(String),

    #[error("due time {0} is not in the future")]
    PastDue(String),

    #[error("description must not be empty")]
    EmptyDescription,

    #[error("nothing to update for task {0}")]
    NothingToUpdate(TaskId),
}
