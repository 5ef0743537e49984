use chrono::{DateTime, Duration, Utc};

use crate::task::{NotifiedState, Task, TaskSnapshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScanEvent {
    DueSoon(Task),
    DueNow(Task),
}

impl ScanEvent {
    pub(crate) fn task(&self) -> &Task {
        match self {
            Self::DueSoon(task) | Self::DueNow(task) => task,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::DueSoon(_) => "due_soon",
            Self::DueNow(_) => "due_now",
        }
    }
}

/// Classifies one task at `now`. A task already past due yields `DueNow` only;
/// its reminder window is skipped rather than fired late.
pub(crate) fn classify(task: &Task, now: DateTime<Utc>, horizon: Duration) -> Option<ScanEvent> {
    let remaining = task.due - now;
    if remaining <= Duration::zero() {
        if task.notified != NotifiedState::DueNowSent {
            return Some(ScanEvent::DueNow(task.clone()));
        }
        return None;
    }
    if remaining <= horizon && task.notified == NotifiedState::None {
        return Some(ScanEvent::DueSoon(task.clone()));
    }
    None
}

/// Events for every task that crossed a threshold, ordered by due time then id.
pub(crate) fn scan(snapshot: &TaskSnapshot, now: DateTime<Utc>, horizon: Duration) -> Vec<ScanEvent> {
    let mut events: Vec<ScanEvent> = snapshot
        .tasks
        .iter()
        .filter_map(|task| classify(task, now, horizon))
        .collect();
    events.sort_by(|a, b| {
        let (a, b) = (a.task(), b.task());
        a.due.cmp(&b.due).then(a.id.cmp(&b.id))
    });
    events
}
