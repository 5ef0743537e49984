use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which process wrote a log line. Both processes may share one log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Daemon,
    Editor,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Editor => "editor",
        }
    }
}

#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    role: Role,
    disabled: AtomicBool,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>, role: Role) -> Self {
        Self {
            path,
            role,
            disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn log_transition(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let line = format!(
            "{} {} pid={} {}\n",
            ts,
            self.role.as_str(),
            std::process::id(),
            sanitize_log_value(message)
        );
        // One write per line in append mode keeps lines from both processes whole.
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                self.disable_with_warning(path, &err);
                return;
            }
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            self.disable_with_warning(path, &err);
        }
    }

    /// Surfaces a problem to the operator and records it in the transition log.
    pub(crate) fn warn(&self, message: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "Warning: {}", message);
        drop(stderr);
        self.log_transition(&format!("warning {}", message));
    }

    fn disable_with_warning(&self, path: &Path, err: &std::io::Error) {
        // Keep the program running, but surface logging failures once and stop retrying.
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "Warning: transition logging disabled log_path={} io_error={}",
                path.display(),
                err
            );
        }
    }
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_log_value_replaces_controls() {
        assert_eq!(
            sanitize_log_value("line\ncarriage\rtab\t"),
            "line\\ncarriage\\rtab\\t"
        );
    }

    #[test]
    fn lines_carry_role_and_pid() {
        let temp = TempDir::new().expect("temp dir");
        let log_path = temp.path().join("tasky.log");
        let daemon = Logger::new(Some(log_path.clone()), Role::Daemon);
        let editor = Logger::new(Some(log_path.clone()), Role::Editor);

        daemon.log_transition("pass_start tasks=2");
        editor.log_transition("add task=3 description=multi\nline");

        let contents = fs::read_to_string(&log_path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let pid = format!("pid={}", std::process::id());
        assert!(lines[0].contains(" daemon ") && lines[0].contains(&pid));
        assert!(lines[0].ends_with("pass_start tasks=2"));
        assert!(lines[1].contains(" editor "));
        assert!(lines[1].ends_with("description=multi\\nline"));
    }

    #[test]
    fn unwritable_log_disables_logging_without_panicking() {
        let temp = TempDir::new().expect("temp dir");
        let logger = Logger::new(Some(temp.path().join("missing").join("tasky.log")), Role::Daemon);
        logger.log_transition("first");
        logger.log_transition("second");
        assert!(logger.disabled.load(Ordering::Relaxed));
    }
}
