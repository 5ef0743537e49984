use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::LockSettings;

const DAY_SECS: u64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) tasks_path: PathBuf,
    pub(crate) history_path: PathBuf,
    pub(crate) passkey_path: PathBuf,
    pub(crate) log_path: Option<PathBuf>,
    pub(crate) poll_interval_seconds: u64,
    pub(crate) due_soon_seconds: u64,
    pub(crate) lock_timeout_ms: u64,
    pub(crate) command_timeout_seconds: u64,
    pub(crate) notifications: Notifications,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks_path: PathBuf::from("tasks.json"),
            history_path: PathBuf::from("completed_tasks.json"),
            passkey_path: PathBuf::from("passkey.json"),
            log_path: None,
            poll_interval_seconds: 20,
            due_soon_seconds: 60,
            lock_timeout_ms: 5000,
            command_timeout_seconds: 300,
            notifications: Notifications::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Notifications {
    /// Endpoint commands; every one receives every notification.
    pub(crate) commands: Vec<String>,
    pub(crate) access_token: Option<String>,
}

impl Config {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub(crate) fn horizon(&self) -> chrono::Duration {
        i64::try_from(self.due_soon_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub(crate) fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            ..LockSettings::default()
        }
    }

    /// Relative store paths are anchored to the directory holding the config file,
    /// so the editor and the daemon agree no matter where they were started.
    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.tasks_path,
            &mut self.history_path,
            &mut self.passkey_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(log_path) = &mut self.log_path {
            if log_path.is_relative() {
                *log_path = base.join(&*log_path);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) warnings: Vec<String>,
}

impl LoadedConfig {
    pub(crate) fn defaults(base: &Path) -> Self {
        let mut config = Config::default();
        config.resolve_paths(base);
        Self {
            config,
            warnings: Vec::new(),
        }
    }
}

pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(format!(
                "Config {} must be a YAML mapping",
                path.display()
            ))
        }
    };

    let warnings = unknown_top_level_keys(&mapping);
    validate_fields(&mapping).map_err(|err| format!("Invalid config {}: {}", path.display(), err))?;

    let mut config: Config = serde_yaml::from_value(Value::Mapping(mapping))
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);

    Ok(LoadedConfig { config, warnings })
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    let allowed = [
        "tasks_path",
        "history_path",
        "passkey_path",
        "log_path",
        "poll_interval_seconds",
        "due_soon_seconds",
        "lock_timeout_ms",
        "command_timeout_seconds",
        "notifications",
    ];

    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !allowed.contains(&key.as_str()))
        .collect()
}

fn validate_fields(mapping: &Mapping) -> Result<(), String> {
    for key in ["tasks_path", "history_path", "passkey_path"] {
        optional_non_empty_string(mapping, key)?;
    }
    optional_non_empty_string(mapping, "log_path")?;
    optional_integer_in_range(mapping, "poll_interval_seconds", 1, DAY_SECS)?;
    optional_integer_in_range(mapping, "due_soon_seconds", 0, 7 * DAY_SECS)?;
    optional_integer_in_range(mapping, "lock_timeout_ms", 1, 600_000)?;
    optional_integer_in_range(mapping, "command_timeout_seconds", 1, DAY_SECS)?;

    if let Some(notifications) = optional_mapping(mapping, "notifications")? {
        if let Some(value) = notifications.get("commands") {
            let Value::Sequence(commands) = value else {
                return Err("notifications.commands must be a list of strings".to_string());
            };
            for (index, command) in commands.iter().enumerate() {
                match command {
                    Value::String(text) if !text.trim().is_empty() => {}
                    Value::String(_) => {
                        return Err(format!("notifications.commands[{}] must not be empty", index))
                    }
                    _ => {
                        return Err(format!("notifications.commands[{}] must be a string", index))
                    }
                }
            }
        }
    }
    Ok(())
}

fn optional_mapping<'a>(mapping: &'a Mapping, key_name: &str) -> Result<Option<&'a Mapping>, String> {
    match mapping.get(key_name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(value)) => Ok(Some(value)),
        Some(_) => Err(format!("{} must be a mapping", key_name)),
    }
}

fn optional_non_empty_string(mapping: &Mapping, key_name: &str) -> Result<(), String> {
    match mapping.get(key_name) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(value)) if value.trim().is_empty() => {
            Err(format!("{} must not be empty", key_name))
        }
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(format!("{} must be a string", key_name)),
    }
}

fn optional_integer_in_range(
    mapping: &Mapping,
    key_name: &str,
    min: u64,
    max: u64,
) -> Result<(), String> {
    match mapping.get(key_name) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Number(number)) => match number.as_u64() {
            Some(value) if (min..=max).contains(&value) => Ok(()),
            _ => Err(format!(
                "{} must be an integer between {} and {} (got {})",
                key_name, min, max, number
            )),
        },
        Some(_) => Err(format!("{} must be an integer", key_name)),
    }
}
