use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::dispatcher::{Dispatcher, PassReport};
use crate::error::StoreError;
use crate::logger::{sanitize_log_value, Logger};
use crate::scanner::{scan, ScanEvent};
use crate::task::TaskSnapshot;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.log_transition(&format!("quit reason={}", sanitized));
    Quit {
        code,
        reason: reason.to_string(),
    }
}

pub(crate) struct DaemonState<'a> {
    pub(crate) dispatcher: Dispatcher<'a>,
    pub(crate) logger: &'a Logger,
    pub(crate) poll_interval: Duration,
    pub(crate) interrupt_flag: Arc<AtomicBool>,
    /// Last snapshot that parsed; used to report what is waiting while degraded.
    pub(crate) last_good: Option<TaskSnapshot>,
    pub(crate) degraded: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Dispatched(PassReport),
    /// The other process held the lock too long; the pass is retried next tick.
    LockBusy,
    /// A store does not parse. Nothing is dispatched until an operator fixes it.
    Degraded { pending_due: Option<usize> },
    Failed,
}

/// One full scan-and-dispatch pass at `now`.
pub(crate) fn tick(state: &mut DaemonState, now: DateTime<Utc>) -> TickOutcome {
    let snapshot = match state.dispatcher.store.load() {
        Ok(snapshot) => snapshot,
        Err(err) => return store_failure(state, err, now),
    };
    state.last_good = Some(snapshot.clone());

    match state.dispatcher.dispatch(&snapshot, now) {
        Ok(report) => {
            if state.degraded {
                state.degraded = false;
                state.logger.log_transition("recovered");
                eprintln!("Stores readable again; resuming dispatch.");
            }
            if report != PassReport::default() {
                state.logger.log_transition(&format!(
                    "pass due_soon={} fired={} stale={} delivery_failures={} command_failures={}",
                    report.due_soon,
                    report.fired,
                    report.stale,
                    report.delivery_failures,
                    report.command_failures
                ));
            }
            TickOutcome::Dispatched(report)
        }
        Err(err) => store_failure(state, err, now),
    }
}

fn store_failure(state: &mut DaemonState, err: StoreError, now: DateTime<Utc>) -> TickOutcome {
    if err.is_lock_timeout() {
        state
            .logger
            .warn(&format!("{}; pass retried next tick", err));
        return TickOutcome::LockBusy;
    }
    if err.is_corrupt() {
        state.degraded = true;
        let store = if err.path() == state.dispatcher.history.path() {
            "history"
        } else {
            "tasks"
        };
        let pending_due = state.last_good.as_ref().map(|snapshot| {
            scan(snapshot, now, ChronoDuration::zero())
                .iter()
                .filter(|event| matches!(event, ScanEvent::DueNow(_)))
                .count()
        });
        let pending = pending_due
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        state.logger.warn(&format!(
            "degraded store={}: {}; pending_due={}; dispatch suspended until the file is repaired",
            store, err, pending
        ));
        return TickOutcome::Degraded { pending_due };
    }
    state.logger.warn(&format!("pass aborted: {}", err));
    TickOutcome::Failed
}

fn interrupted(state: &DaemonState) -> bool {
    state.interrupt_flag.load(Ordering::SeqCst)
}

/// Sleeps for the poll interval, waking early when a termination signal arrives.
fn sleep_until_next_tick(state: &DaemonState) {
    let deadline = Instant::now().checked_add(state.poll_interval);
    while !interrupted(state) {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                SLEEP_SLICE.min(deadline - now)
            }
            None => SLEEP_SLICE,
        };
        thread::sleep(slice);
    }
}

/// Polls until a termination signal arrives. The flag is only honoured between
/// passes, so a pass that started always finishes and persists.
pub(crate) fn run_loop(state: &mut DaemonState, once: bool) -> Result<(), Quit> {
    state.logger.log_transition(&format!(
        "daemon start interval_secs={} horizon_secs={} tasks={} history={}",
        state.poll_interval.as_secs(),
        state.dispatcher.horizon.num_seconds(),
        state.dispatcher.store.path().display(),
        state.dispatcher.history.path().display()
    ));
    loop {
        if interrupted(state) {
            state.logger.log_transition("daemon stop reason=signal");
            return Ok(());
        }
        let outcome = tick(state, Utc::now());
        if once {
            return match outcome {
                TickOutcome::Dispatched(_) => Ok(()),
                TickOutcome::LockBusy => Err(quit(state.logger, "lock_busy", 1)),
                TickOutcome::Degraded { .. } => Err(quit(state.logger, "store_corrupt", 1)),
                TickOutcome::Failed => Err(quit(state.logger, "pass_failed", 1)),
            };
        }
        sleep_until_next_tick(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandExecutionError, NotificationDeliveryError};
    use crate::history::HistoryStore;
    use crate::lock::LockSettings;
    use crate::logger::Role;
    use crate::notify::NotificationSink;
    use crate::shell::{CommandExecutor, CommandOutput};
    use crate::store::TaskStore;
    use crate::task::{Priority, Task};
    use std::fs;
    use tempfile::TempDir;

    struct Quiet;

    impl NotificationSink for Quiet {
        fn send(&self, _title: &str, _body: &str) -> Result<(), NotificationDeliveryError> {
            Ok(())
        }
    }

    impl CommandExecutor for Quiet {
        fn execute(&self, _command: &str) -> Result<CommandOutput, CommandExecutionError> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    #[derive(Default)]
    struct Counting {
        sends: std::cell::Cell<usize>,
        runs: std::cell::Cell<usize>,
    }

    impl NotificationSink for Counting {
        fn send(&self, _title: &str, _body: &str) -> Result<(), NotificationDeliveryError> {
            self.sends.set(self.sends.get() + 1);
            Ok(())
        }
    }

    impl CommandExecutor for Counting {
        fn execute(&self, command: &str) -> Result<CommandOutput, CommandExecutionError> {
            self.runs.set(self.runs.get() + 1);
            Quiet.execute(command)
        }
    }

    struct Fixture {
        temp: TempDir,
        store: TaskStore,
        history: HistoryStore,
        logger: Logger,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        Fixture {
            store: TaskStore::new(
                temp.path().join("tasks.json"),
                LockSettings {
                    timeout: Duration::from_millis(50),
                    stale_after: Duration::from_secs(30),
                },
            ),
            history: HistoryStore::new(temp.path().join("completed_tasks.json")),
            logger: Logger::new(None, Role::Daemon),
            temp,
        }
    }

    fn daemon<'a>(fx: &'a Fixture, interval: Duration) -> DaemonState<'a> {
        DaemonState {
            dispatcher: Dispatcher {
                store: &fx.store,
                history: &fx.history,
                sink: &Quiet,
                executor: &Quiet,
                logger: &fx.logger,
                horizon: ChronoDuration::seconds(60),
            },
            logger: &fx.logger,
            poll_interval: interval,
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            last_good: None,
            degraded: false,
        }
    }

    fn seed_overdue(store: &TaskStore) {
        store
            .transaction(|snapshot, _| {
                let id = snapshot.allocate_id();
                let due = Utc::now() - ChronoDuration::seconds(5);
                snapshot
                    .tasks
                    .push(Task::new(id, "overdue", due, Priority::Low, due));
                Ok::<_, StoreError>(())
            })
            .expect("seed");
    }

    #[test]
    fn corrupt_store_degrades_then_recovers() {
        let fx = fixture();
        seed_overdue(&fx.store);
        let mut state = daemon(&fx, Duration::from_secs(1));
        state.last_good = Some(fx.store.load().expect("load"));
        let good = fs::read_to_string(fx.store.path()).expect("read");

        fs::write(fx.store.path(), "{ not json").expect("corrupt");
        let outcome = tick(&mut state, Utc::now());
        assert_eq!(outcome, TickOutcome::Degraded { pending_due: Some(1) });
        assert!(state.degraded);
        assert_eq!(
            fs::read_to_string(fx.store.path()).expect("read"),
            "{ not json",
            "corrupt store must not be replaced"
        );

        fs::write(fx.store.path(), good).expect("repair");
        let outcome = tick(&mut state, Utc::now());
        assert!(matches!(outcome, TickOutcome::Dispatched(ref report) if report.fired == 1));
        assert!(!state.degraded);
    }

    #[test]
    fn held_lock_defers_the_pass() {
        let fx = fixture();
        seed_overdue(&fx.store);
        let _held = crate::lock::StoreLockGuard::acquire(
            &fx.temp.path().join("tasks.json.lock"),
            &LockSettings::default(),
        )
        .expect("hold lock");
        let mut state = daemon(&fx, Duration::from_secs(1));

        assert_eq!(tick(&mut state, Utc::now()), TickOutcome::LockBusy);
        assert_eq!(fx.store.load().expect("load").tasks.len(), 1);
    }

    #[test]
    fn once_runs_a_single_pass() {
        let fx = fixture();
        seed_overdue(&fx.store);
        let mut state = daemon(&fx, Duration::from_secs(3600));
        run_loop(&mut state, true).expect("single pass");
        assert!(fx.store.load().expect("load").tasks.is_empty());
        assert_eq!(fx.history.load().expect("history").len(), 1);
    }

    #[test]
    fn interrupt_stops_the_loop_during_sleep() {
        let fx = fixture();
        let mut state = daemon(&fx, Duration::from_secs(3600));
        let flag = Arc::clone(&state.interrupt_flag);
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        run_loop(&mut state, false).expect("clean shutdown");
        assert!(started.elapsed() < Duration::from_secs(5));
        trigger.join().expect("join trigger");
    }

    #[test]
    fn corrupt_history_degrades_without_side_effects() {
        let fx = fixture();
        fx.store
            .transaction(|snapshot, _| {
                let id = snapshot.allocate_id();
                let due = Utc::now() - ChronoDuration::seconds(5);
                snapshot
                    .tasks
                    .push(Task::new(id, "-e ./deploy.sh", due, Priority::High, due));
                Ok::<_, StoreError>(())
            })
            .expect("seed");
        fs::write(fx.history.path(), "[{").expect("corrupt history");
        let log_path = fx.temp.path().join("tasky.log");
        let logger = Logger::new(Some(log_path.clone()), Role::Daemon);
        let counting = Counting::default();
        let mut state = daemon(&fx, Duration::from_secs(1));
        state.dispatcher.sink = &counting;
        state.dispatcher.executor = &counting;
        state.dispatcher.logger = &logger;
        state.logger = &logger;

        for _ in 0..3 {
            assert_eq!(
                tick(&mut state, Utc::now()),
                TickOutcome::Degraded { pending_due: Some(1) }
            );
        }
        assert_eq!((counting.sends.get(), counting.runs.get()), (0, 0));
        let log = fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("degraded store=history"), "log: {log}");
        assert!(!log.contains("recovered"), "log: {log}");

        fs::write(fx.history.path(), "[]").expect("repair history");
        let outcome = tick(&mut state, Utc::now());
        assert!(matches!(outcome, TickOutcome::Dispatched(ref report) if report.fired == 1));
        assert_eq!((counting.sends.get(), counting.runs.get()), (1, 1));
        assert!(fs::read_to_string(&log_path).expect("read log").contains("recovered"));
        assert!(!state.degraded);
    }

    #[test]
    fn huge_poll_interval_does_not_overflow_sleep() {
        let fx = fixture();
        let mut state = daemon(&fx, Duration::MAX);
        state.interrupt_flag.store(true, Ordering::SeqCst);
        sleep_until_next_tick(&state);
        run_loop(&mut state, false).expect("clean shutdown");
    }
}
