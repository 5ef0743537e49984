use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::lock::StoreLockGuard;
use crate::store::{read_json, write_json_atomic};
use crate::task::{Task, TaskId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CompletionReason {
    Fired,
    ManuallyDeleted,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fired => "fired",
            Self::ManuallyDeleted => "manually_deleted",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HistoryRecord {
    pub(crate) task: Task,
    pub(crate) completed_at: DateTime<Utc>,
    pub(crate) reason: CompletionReason,
}

/// Append-only log of tasks that left the Task Store.
#[derive(Debug, Clone)]
pub(crate) struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn load(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        read_json(&self.path)
    }

    /// Appends `record` unless a record for the same task id already exists,
    /// which makes a retried move a no-op. Returns whether the record was written.
    /// Requires the Task Store lock so both stores change under one critical section.
    pub(crate) fn append(
        &self,
        record: HistoryRecord,
        _guard: &StoreLockGuard,
    ) -> Result<bool, StoreError> {
        let mut records = self.load()?;
        if contains(&records, record.task.id) {
            return Ok(false);
        }
        records.push(record);
        write_json_atomic(&self.path, &records)?;
        Ok(true)
    }
}

fn contains(records: &[HistoryRecord], id: TaskId) -> bool {
    records.iter().any(|record| record.task.id == id)
}
