use chrono::{DateTime, Duration, Utc};

use crate::error::{DispatchError, StoreError};
use crate::history::{CompletionReason, HistoryRecord, HistoryStore};
use crate::logger::Logger;
use crate::notify::{NotificationSink, TITLE};
use crate::scanner::{scan, ScanEvent};
use crate::shell::{logged, CommandExecutor};
use crate::store::TaskStore;
use crate::task::{format_local, NotifiedState, Task, TaskId, TaskSnapshot};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PassReport {
    pub(crate) due_soon: usize,
    pub(crate) fired: usize,
    /// Events dropped because the task was edited or deleted after the scan.
    pub(crate) stale: usize,
    pub(crate) delivery_failures: usize,
    pub(crate) command_failures: usize,
}

/// Turns scanner events into side effects. Each event is handled to completion
/// (side effects first, then one store transaction) before the next begins; the
/// store lock is never held while a notification or command runs.
pub(crate) struct Dispatcher<'a> {
    pub(crate) store: &'a TaskStore,
    pub(crate) history: &'a HistoryStore,
    pub(crate) sink: &'a dyn NotificationSink,
    pub(crate) executor: &'a dyn CommandExecutor,
    pub(crate) logger: &'a Logger,
    pub(crate) horizon: Duration,
}

impl Dispatcher<'_> {
    /// Loads the Task Store and dispatches everything that is due at `now`.
    pub(crate) fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let snapshot = self.store.load()?;
        self.dispatch(&snapshot, now)
    }

    /// Dispatches the events of `snapshot`. The History Store is checked first:
    /// a move that cannot be persisted must not fire its side effects.
    pub(crate) fn dispatch(
        &self,
        snapshot: &TaskSnapshot,
        now: DateTime<Utc>,
    ) -> Result<PassReport, StoreError> {
        self.history.load()?;
        let mut report = PassReport::default();
        for event in scan(snapshot, now, self.horizon) {
            self.logger.log_transition(&format!(
                "event={} task={} due={}",
                event.label(),
                event.task().id,
                event.task().due.to_rfc3339()
            ));
            match event {
                ScanEvent::DueSoon(task) => self.handle_due_soon(&task, now, &mut report)?,
                ScanEvent::DueNow(task) => self.handle_due_now(&task, now, &mut report)?,
            }
        }
        Ok(report)
    }

    fn handle_due_soon(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        let remaining = (task.due - now).num_seconds().max(0);
        let body = format!(
            "Task Due Soon\nTask: {} due in {} seconds",
            task.description, remaining
        );
        if !self.notify(&body) {
            report.delivery_failures += 1;
        }

        let applied = self.store.transaction(|snapshot, _guard| {
            match snapshot.get_mut(task.id) {
                Some(current) if current.due == task.due && current.notified == NotifiedState::None => {
                    current.notified = NotifiedState::DueSoonSent;
                    Ok::<_, StoreError>(true)
                }
                _ => Ok(false),
            }
        })?;
        if applied {
            report.due_soon += 1;
            self.logger
                .log_transition(&format!("due_soon_sent task={}", task.id));
        } else {
            report.stale += 1;
            self.logger
                .log_transition(&format!("stale event=due_soon task={}", task.id));
        }
        Ok(())
    }

    fn handle_due_now(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        let mut body = format!(
            "Task Due\nTask: {}\nTime: {}\nPriority: {}",
            task.description,
            format_local(task.due),
            task.priority
        );
        if let Some(command) = &task.command {
            let label = format!("task-{}", task.id);
            match logged(self.logger, &label, command, || self.executor.execute(command)) {
                Ok(output) => {
                    if !output.success() {
                        report.command_failures += 1;
                    }
                    body.push_str(&format!(
                        "\nCommand: {}\nExit: {}\nOutput: {}\nError: {}",
                        command,
                        output.exit_code,
                        output.stdout.trim_end(),
                        output.stderr.trim_end()
                    ));
                }
                Err(err) => {
                    report.command_failures += 1;
                    body.push_str(&format!("\nCommand: {}\nError: {}", command, err));
                }
            }
        }
        if !self.notify(&body) {
            report.delivery_failures += 1;
        }

        let moved = self.store.transaction(|snapshot, guard| {
            let Some(index) = snapshot
                .tasks
                .iter()
                .position(|current| current.id == task.id && current.due == task.due)
            else {
                return Ok::<_, StoreError>(false);
            };
            let mut completed = snapshot.tasks.remove(index);
            completed.notified = NotifiedState::DueNowSent;
            self.history.append(
                HistoryRecord {
                    task: completed,
                    completed_at: now,
                    reason: CompletionReason::Fired,
                },
                guard,
            )?;
            Ok(true)
        })?;
        if moved {
            report.fired += 1;
            self.logger.log_transition(&format!("fired task={}", task.id));
        } else {
            report.stale += 1;
            self.logger
                .log_transition(&format!("stale event=due_now task={}", task.id));
        }
        Ok(())
    }

    /// Removes a task on the user's request and records it in the History Store.
    /// The deletion notice goes out before anything is persisted, like every
    /// other transition.
    pub(crate) fn delete(&self, id: TaskId, now: DateTime<Utc>) -> Result<Task, DispatchError> {
        let task = self
            .store
            .load()?
            .remove(id)
            .ok_or(DispatchError::TaskNotFound(id))?;
        self.history.load()?;

        self.notify(&format!(
            "Task Deleted\nTask: {}\nTime: {}",
            task.description,
            format_local(task.due)
        ));

        let removed = self.store.transaction(|snapshot, guard| {
            let Some(removed) = snapshot.remove(id) else {
                return Ok::<_, StoreError>(None);
            };
            self.history.append(
                HistoryRecord {
                    task: removed.clone(),
                    completed_at: now,
                    reason: CompletionReason::ManuallyDeleted,
                },
                guard,
            )?;
            Ok(Some(removed))
        })?;
        match removed {
            Some(removed) => {
                self.logger
                    .log_transition(&format!("deleted task={}", removed.id));
                Ok(removed)
            }
            None => {
                self.logger
                    .log_transition(&format!("stale event=delete task={}", id));
                Err(DispatchError::TaskNotFound(id))
            }
        }
    }

    /// Sends one notification; failures are logged and dropped so they never
    /// hold up the state transition. Returns whether delivery succeeded.
    pub(crate) fn notify(&self, body: &str) -> bool {
        match self.sink.send(TITLE, body) {
            Ok(()) => {
                self.logger
                    .log_transition(&format!("notify sent body={}", body));
                true
            }
            Err(err) => {
                self.logger.warn(&format!("notification dropped: {}", err));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandExecutionError, NotificationDeliveryError};
    use crate::lock::LockSettings;
    use crate::logger::Role;
    use crate::shell::CommandOutput;
    use crate::task::Priority;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        sent: RefCell<Vec<String>>,
        fail: bool,
        crash: bool,
    }

    impl NotificationSink for RecordingSink {
        fn send(&self, _title: &str, body: &str) -> Result<(), NotificationDeliveryError> {
            self.sent.borrow_mut().push(body.to_string());
            if self.crash {
                panic!("process killed while notifying");
            }
            if self.fail {
                return Err(NotificationDeliveryError::single("sink unreachable"));
            }
            Ok(())
        }
    }

    struct FakeExecutor {
        result: fn() -> Result<CommandOutput, CommandExecutionError>,
        calls: RefCell<Vec<String>>,
    }

    impl CommandExecutor for FakeExecutor {
        fn execute(&self, command: &str) -> Result<CommandOutput, CommandExecutionError> {
            self.calls.borrow_mut().push(command.to_string());
            (self.result)()
        }
    }

    fn ok_output() -> Result<CommandOutput, CommandExecutionError> {
        Ok(CommandOutput {
            stdout: "backup done\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn failed_launch() -> Result<CommandOutput, CommandExecutionError> {
        Err(CommandExecutionError::Launch {
            command: "missing-tool".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        })
    }

    struct Fixture {
        _temp: TempDir,
        store: TaskStore,
        history: HistoryStore,
        logger: Logger,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        Fixture {
            store: TaskStore::new(temp.path().join("tasks.json"), LockSettings::default()),
            history: HistoryStore::new(temp.path().join("completed_tasks.json")),
            logger: Logger::new(None, Role::Daemon),
            _temp: temp,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn seed(store: &TaskStore, description: &str, due_in_secs: i64) -> TaskId {
        store
            .transaction(|snapshot, _| {
                let id = snapshot.allocate_id();
                snapshot.tasks.push(Task::new(
                    id,
                    description,
                    t0() + Duration::seconds(due_in_secs),
                    Priority::High,
                    t0(),
                ));
                Ok::<_, StoreError>(id)
            })
            .expect("seed task")
    }

    fn dispatcher<'a>(
        fx: &'a Fixture,
        sink: &'a RecordingSink,
        executor: &'a FakeExecutor,
    ) -> Dispatcher<'a> {
        Dispatcher {
            store: &fx.store,
            history: &fx.history,
            sink,
            executor,
            logger: &fx.logger,
            horizon: Duration::seconds(60),
        }
    }

    fn executor(result: fn() -> Result<CommandOutput, CommandExecutionError>) -> FakeExecutor {
        FakeExecutor {
            result,
            calls: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn due_now_runs_command_and_reports_output() {
        let fx = fixture();
        seed(&fx.store, "-e ./backup.sh", -1);
        let sink = RecordingSink::default();
        let exec = executor(ok_output);

        let report = dispatcher(&fx, &sink, &exec).run_pass(t0()).expect("pass");

        assert_eq!(report.fired, 1);
        assert_eq!(exec.calls.borrow().as_slice(), ["./backup.sh"]);
        let sent = sink.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Task Due\nTask: -e ./backup.sh"));
        assert!(sent[0].contains("Command: ./backup.sh\nExit: 0\nOutput: backup done"));
        assert!(fx.store.load().expect("load").tasks.is_empty());
    }

    #[test]
    fn command_launch_failure_is_reported_not_escalated() {
        let fx = fixture();
        seed(&fx.store, "--execute missing-tool", 0);
        let sink = RecordingSink::default();
        let exec = executor(failed_launch);

        let report = dispatcher(&fx, &sink, &exec).run_pass(t0()).expect("pass");

        assert_eq!(report.command_failures, 1);
        assert_eq!(report.fired, 1);
        assert!(sink.sent.borrow()[0].contains("Error: failed to launch command 'missing-tool'"));
    }

    #[test]
    fn delivery_failure_still_persists_transition() {
        let fx = fixture();
        let id = seed(&fx.store, "dentist", 30);
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let exec = executor(ok_output);
        let dispatcher = dispatcher(&fx, &sink, &exec);

        let report = dispatcher.run_pass(t0()).expect("pass");
        assert_eq!(report.delivery_failures, 1);
        assert_eq!(report.due_soon, 1);
        let snapshot = fx.store.load().expect("load");
        assert_eq!(
            snapshot.get(id).map(|task| task.notified),
            Some(NotifiedState::DueSoonSent)
        );

        let report = dispatcher.run_pass(t0()).expect("second pass");
        assert_eq!(report, PassReport::default());
        assert_eq!(sink.sent.borrow().len(), 1);
    }

    #[test]
    fn edit_between_scan_and_commit_makes_event_stale() {
        let fx = fixture();
        let id = seed(&fx.store, "report", 10);
        let scanned = fx.store.load().expect("load");

        fx.store
            .transaction(|snapshot, _| {
                if let Some(task) = snapshot.get_mut(id) {
                    task.reschedule(t0() + Duration::hours(5));
                }
                Ok::<_, StoreError>(())
            })
            .expect("editor reschedule");

        let sink = RecordingSink::default();
        let exec = executor(ok_output);
        let report = dispatcher(&fx, &sink, &exec)
            .dispatch(&scanned, t0() + Duration::seconds(20))
            .expect("dispatch stale snapshot");

        assert_eq!(report.stale, 1);
        assert_eq!(report.fired, 0);
        let snapshot = fx.store.load().expect("load");
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].notified, NotifiedState::None);
        assert!(fx.history.load().expect("history").is_empty());
    }

    #[test]
    fn manual_delete_moves_task_to_history_and_notifies() {
        let fx = fixture();
        let keep = seed(&fx.store, "keep", 3600);
        let gone = seed(&fx.store, "gone", 3600);
        let sink = RecordingSink::default();
        let exec = executor(ok_output);

        let removed = dispatcher(&fx, &sink, &exec)
            .delete(gone, t0())
            .expect("delete");

        assert_eq!(removed.id, gone);
        let snapshot = fx.store.load().expect("load");
        assert!(snapshot.get(keep).is_some() && snapshot.get(gone).is_none());
        let history = fx.history.load().expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, CompletionReason::ManuallyDeleted);
        assert!(sink.sent.borrow()[0].starts_with("Task Deleted\nTask: gone"));
    }

    #[test]
    fn deleting_unknown_task_fails_without_side_effects() {
        let fx = fixture();
        let sink = RecordingSink::default();
        let exec = executor(ok_output);

        let err = dispatcher(&fx, &sink, &exec)
            .delete(TaskId::new(42), t0())
            .expect_err("unknown id");
        assert!(matches!(err, DispatchError::TaskNotFound(id) if id.get() == 42));
        assert!(sink.sent.borrow().is_empty());
        assert!(fx.history.load().expect("history").is_empty());
    }

    #[test]
    fn crash_while_notifying_a_delete_keeps_the_task() {
        let fx = fixture();
        let id = seed(&fx.store, "dentist", 3600);
        let sink = RecordingSink {
            crash: true,
            ..RecordingSink::default()
        };
        let exec = executor(ok_output);

        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher(&fx, &sink, &exec).delete(id, t0())
        }));
        assert!(crashed.is_err());
        assert_eq!(sink.sent.borrow().len(), 1);
        assert!(fx.store.load().expect("load").get(id).is_some());
        assert!(fx.history.load().expect("history").is_empty());

        let sink = RecordingSink::default();
        dispatcher(&fx, &sink, &exec)
            .delete(id, t0())
            .expect("retried delete");
        assert!(fx.store.load().expect("load").tasks.is_empty());
        assert_eq!(fx.history.load().expect("history").len(), 1);
    }

    #[test]
    fn corrupt_history_blocks_side_effects() {
        let fx = fixture();
        let id = seed(&fx.store, "-e ./deploy.sh", -1);
        std::fs::write(fx.history.path(), "[{").expect("corrupt history");
        let sink = RecordingSink::default();
        let exec = executor(ok_output);
        let dispatcher = dispatcher(&fx, &sink, &exec);

        let err = dispatcher.run_pass(t0()).expect_err("history is corrupt");
        assert!(err.is_corrupt());
        let err = dispatcher.delete(id, t0()).expect_err("delete refused");
        assert!(matches!(err, DispatchError::Store(ref inner) if inner.is_corrupt()));

        assert!(exec.calls.borrow().is_empty());
        assert!(sink.sent.borrow().is_empty());
        assert_eq!(
            fx.store.load().expect("load").get(id).map(|task| task.notified),
            Some(NotifiedState::None)
        );
    }
}
