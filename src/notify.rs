use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::config::Notifications;
use crate::error::NotificationDeliveryError;
use crate::shell::run_shell_command_capture;

pub(crate) const TITLE: &str = "Tasky:";

/// Best-effort delivery to every registered endpoint. No receipt is expected.
pub(crate) trait NotificationSink {
    fn send(&self, title: &str, body: &str) -> Result<(), NotificationDeliveryError>;
}

#[derive(Debug, Serialize)]
pub(crate) struct NotificationPayload<'a> {
    pub(crate) title: &'a str,
    pub(crate) body: &'a str,
    pub(crate) sent_at: String,
}

impl NotificationPayload<'_> {
    pub(crate) fn write_to_temp_file(&self) -> Result<NamedTempFile, String> {
        let mut payload_file = NamedTempFile::new()
            .map_err(|err| format!("failed to create notification payload file: {err}"))?;
        serde_json::to_writer(&mut payload_file, self)
            .map_err(|err| format!("failed to serialize notification payload: {err}"))?;
        payload_file
            .write_all(b"\n")
            .map_err(|err| format!("failed to finalize notification payload file: {err}"))?;
        Ok(payload_file)
    }
}

/// Delivers each notification by running every configured endpoint command.
/// The message reaches the command through `TASKY_NOTIFICATION_*` variables and
/// a JSON payload file; the endpoint credential through `TASKY_ACCESS_TOKEN`.
#[derive(Debug)]
pub(crate) struct HookSink {
    commands: Vec<String>,
    access_token: Option<String>,
    timeout: Duration,
    warned_unconfigured: AtomicBool,
}

impl HookSink {
    pub(crate) fn new(notifications: &Notifications, timeout: Duration) -> Self {
        Self {
            commands: notifications
                .commands
                .iter()
                .map(|command| command.trim().to_string())
                .filter(|command| !command.is_empty())
                .collect(),
            access_token: notifications.access_token.clone(),
            timeout,
            warned_unconfigured: AtomicBool::new(false),
        }
    }

    fn deliver(&self, index: usize, command: &str, payload: &NotificationPayload) -> Result<(), String> {
        let payload_file = payload.write_to_temp_file()?;
        let mut env = vec![
            ("TASKY_NOTIFICATION_TITLE", payload.title.to_string()),
            ("TASKY_NOTIFICATION_BODY", payload.body.to_string()),
            (
                "TASKY_NOTIFICATION_FILE",
                payload_file.path().display().to_string(),
            ),
        ];
        if let Some(token) = &self.access_token {
            env.push(("TASKY_ACCESS_TOKEN", token.clone()));
        }
        let output = run_shell_command_capture(command, &env, self.timeout)
            .map_err(|err| format!("endpoint {}: {}", index, err))?;
        if !output.success() {
            return Err(format!(
                "endpoint {} exited with code {}: {}",
                index,
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

impl NotificationSink for HookSink {
    fn send(&self, title: &str, body: &str) -> Result<(), NotificationDeliveryError> {
        if self.commands.is_empty() {
            if !self.warned_unconfigured.swap(true, Ordering::SeqCst) {
                eprintln!("Warning: no notification endpoint configured (notifications.commands); notifications are only logged.");
            }
            return Ok(());
        }

        let payload = NotificationPayload {
            title,
            body,
            sent_at: Utc::now().to_rfc3339(),
        };
        let failures: Vec<String> = self
            .commands
            .iter()
            .enumerate()
            .filter_map(|(index, command)| self.deliver(index, command, &payload).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NotificationDeliveryError { failures })
        }
    }
}
