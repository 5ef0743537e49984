use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::error::{EditorError, StoreError};
use crate::history::HistoryRecord;
use crate::store::TaskStore;
use crate::task::{format_local, Priority, Task, TaskId};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TaskUpdate {
    pub(crate) description: Option<String>,
    pub(crate) due: Option<DateTime<Utc>>,
    pub(crate) priority: Option<Priority>,
}

impl TaskUpdate {
    fn is_empty(&self) -> bool {
        self.description.is_none() && self.due.is_none() && self.priority.is_none()
    }
}

pub(crate) fn add_task(
    store: &TaskStore,
    description: &str,
    due: DateTime<Utc>,
    priority: Priority,
    now: DateTime<Utc>,
) -> Result<Task, EditorError> {
    if description.trim().is_empty() {
        return Err(EditorError::EmptyDescription);
    }
    if due <= now {
        return Err(EditorError::PastDue(format_local(due)));
    }
    store.transaction(|snapshot, _| {
        let id = snapshot.allocate_id();
        let task = Task::new(id, description, due, priority, now);
        snapshot.tasks.push(task.clone());
        Ok(task)
    })
}

/// Applies `update` to task `id`. A changed due time re-arms the task's
/// notifications.
pub(crate) fn edit_task(
    store: &TaskStore,
    id: TaskId,
    update: TaskUpdate,
    now: DateTime<Utc>,
) -> Result<Task, EditorError> {
    if update.is_empty() {
        return Err(EditorError::NothingToUpdate(id));
    }
    if let Some(description) = &update.description {
        if description.trim().is_empty() {
            return Err(EditorError::EmptyDescription);
        }
    }
    if let Some(due) = update.due {
        if due <= now {
            return Err(EditorError::PastDue(format_local(due)));
        }
    }
    store.transaction(|snapshot, _| {
        let task = snapshot.get_mut(id).ok_or(EditorError::TaskNotFound(id))?;
        if let Some(description) = &update.description {
            task.set_description(description);
        }
        if let Some(due) = update.due {
            task.reschedule(due);
        }
        if let Some(priority) = update.priority {
            task.priority = priority;
        }
        Ok(task.clone())
    })
}

pub(crate) fn list_tasks(store: &TaskStore) -> Result<Vec<Task>, StoreError> {
    let snapshot = store.load()?;
    Ok(snapshot.sorted().into_iter().cloned().collect())
}

pub(crate) fn added_message(task: &Task) -> String {
    format!(
        "New Task Added!\nTask: {}\nTime: {}\nPriority Level: {}",
        task.description,
        format_local(task.due),
        task.priority
    )
}

pub(crate) fn render_tasks(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks scheduled.\n".to_string();
    }
    let width = description_width(tasks.iter().map(|task| task.description.as_str()));
    let mut out = format!(
        "{:>4}  {:<width$}  {:<19}  {:<8}  {}\n",
        "ID", "Task", "Due", "Priority", "Notified"
    );
    for task in tasks {
        let _ = writeln!(
            out,
            "{:>4}  {:<width$}  {:<19}  {:<8}  {}",
            task.id,
            task.description,
            format_local(task.due),
            task.priority,
            task.notified
        );
    }
    out
}

pub(crate) fn render_history(records: &[HistoryRecord]) -> String {
    if records.is_empty() {
        return "No past tasks.\n".to_string();
    }
    let width = description_width(records.iter().map(|record| record.task.description.as_str()));
    let mut out = format!(
        "{:>4}  {:<width$}  {:<19}  {:<8}  {:<19}  {}\n",
        "ID", "Task", "Due", "Priority", "Completed", "Reason"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:>4}  {:<width$}  {:<19}  {:<8}  {:<19}  {}",
            record.task.id,
            record.task.description,
            format_local(record.task.due),
            record.task.priority,
            format_local(record.completed_at),
            record.reason
        );
    }
    out
}

fn description_width<'a>(descriptions: impl Iterator<Item = &'a str>) -> usize {
    descriptions
        .map(|text| text.chars().count())
        .max()
        .unwrap_or(0)
        .clamp(4, 48)
}

fn hour_only() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?i)(\d{1,2})\s*([ap]m)$").expect("hour pattern is valid")
    })
}

/// Reads a due time typed by a person. Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]`,
/// `YYYY-MM-DD` (midnight), and for today `HH:MM`, `H:MM AM` or `H AM`.
/// Times without an offset are local.
pub(crate) fn parse_due_time(input: &str, now: DateTime<Local>) -> Result<DateTime<Utc>, EditorError> {
    let trimmed = input.trim();
    let invalid = || EditorError::InvalidTime(trimmed.to_string());
    if trimmed.is_empty() {
        return Err(invalid());
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.with_timezone(&Utc));
    }

    let naive = parse_naive(trimmed, now.date_naive()).ok_or_else(invalid)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(invalid)
}

fn parse_naive(input: &str, today: NaiveDate) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(input, format) {
            return Some(at);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN));
    }
    let upper = input.to_ascii_uppercase();
    for format in ["%H:%M", "%I:%M %p", "%I:%M%p"] {
        if let Ok(time) = NaiveTime::parse_from_str(&upper, format) {
            return Some(today.and_time(time));
        }
    }
    let captures = hour_only().captures(input)?;
    let rewritten = format!("{}:00 {}", &captures[1], captures[2].to_ascii_uppercase());
    NaiveTime::parse_from_str(&rewritten, "%I:%M %p")
        .ok()
        .map(|time| today.and_time(time))
}
