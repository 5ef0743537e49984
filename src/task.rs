use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn get(self) -> u64 {
        self.0
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("task id must not be empty".to_string());
        }
        trimmed
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .map(Self)
            .ok_or_else(|| format!("task id must be a positive integer (got {:?})", trimmed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Declaration order is the priority order: `Low < Medium < High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Accepts names as well as the numeric levels 1 (high), 2 (medium) and 3 (low).
    pub(crate) fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "1" | "high" | "h" => Some(Self::High),
            "2" | "medium" | "med" | "m" => Some(Self::Medium),
            "3" | "low" | "l" => Some(Self::Low),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            format!(
                "invalid priority {:?} (use high, medium, low or 1, 2, 3)",
                value.trim()
            )
        })
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Notification progress of a task. Only ever moves forward, except when the
/// editor changes the due time, which resets it to `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum NotifiedState {
    #[default]
    None,
    DueSoonSent,
    DueNowSent,
}

impl NotifiedState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DueSoonSent => "due_soon_sent",
            Self::DueNowSent => "due_now_sent",
        }
    }
}

impl fmt::Display for NotifiedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) description: String,
    pub(crate) due: DateTime<Utc>,
    pub(crate) priority: Priority,
    pub(crate) created: DateTime<Utc>,
    #[serde(default)]
    pub(crate) notified: NotifiedState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) command: Option<String>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        description: &str,
        due: DateTime<Utc>,
        priority: Priority,
        created: DateTime<Utc>,
    ) -> Self {
        let description = description.trim().to_string();
        let command = parse_execute_directive(&description);
        Self {
            id,
            description,
            due,
            priority,
            created,
            notified: NotifiedState::None,
            command,
        }
    }

    pub(crate) fn set_description(&mut self, description: &str) {
        self.description = description.trim().to_string();
        self.command = parse_execute_directive(&self.description);
    }

    pub(crate) fn reschedule(&mut self, due: DateTime<Utc>) {
        if self.due != due {
            self.due = due;
            self.notified = NotifiedState::None;
        }
    }
}

/// Renders a timestamp in the machine's local time zone for people to read.
pub(crate) fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn execute_directive() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:-e|--execute)\s+(.*\S)\s*$").expect("execute directive pattern is valid")
    })
}

/// Extracts the command from a description of the form `-e <cmd>` or `--execute <cmd>`.
pub(crate) fn parse_execute_directive(description: &str) -> Option<String> {
    execute_directive()
        .captures(description.trim())
        .and_then(|captures| captures.get(1))
        .map(|command| command.as_str().to_string())
}

/// The full Task Store contents at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TaskSnapshot {
    #[serde(default)]
    pub(crate) next_id: u64,
    #[serde(default)]
    pub(crate) tasks: Vec<Task>,
}

impl TaskSnapshot {
    /// Ids come from a persisted counter so that an id is never handed out twice,
    /// even after its task has moved to the History Store.
    pub(crate) fn allocate_id(&mut self) -> TaskId {
        let floor = self
            .tasks
            .iter()
            .map(|task| task.id.get())
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        let id = self.next_id.max(floor).max(1);
        self.next_id = id + 1;
        TaskId::new(id)
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
        let index = self.tasks.iter().position(|task| task.id == id)?;
        Some(self.tasks.remove(index))
    }

    /// Soonest first; among equal due times, higher priority first.
    pub(crate) fn sorted(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().collect();
        tasks.sort_by(|a, b| {
            a.due
                .cmp(&b.due)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });
        tasks
    }
}
