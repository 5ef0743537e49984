use chrono::{Local, Utc};
use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::auth::{authenticate, Authenticator, PasskeyFile};
use crate::cli::{Cli, CliCommand, PasskeyAction};
use crate::config::{load_config, LoadedConfig};
use crate::dispatcher::Dispatcher;
use crate::editor::{
    add_task, added_message, edit_task, list_tasks, parse_due_time, render_history, render_tasks,
    TaskUpdate,
};
use crate::history::HistoryStore;
use crate::logger::{Logger, Role};
use crate::notify::HookSink;
use crate::run_loop::{quit, run_loop, DaemonState, Quit};
use crate::shell::ShellExecutor;
use crate::store::TaskStore;

const DEFAULT_CONFIG_REL: &str = ".config/tasky/config.yml";
const PASSKEY_ENV: &str = "TASKY_PASSKEY";
const NEW_PASSKEY_ENV: &str = "TASKY_NEW_PASSKEY";

fn home_dir() -> Result<PathBuf, String> {
    env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| "Missing HOME environment variable".to_string())
}

fn resolve_config(explicit: Option<PathBuf>) -> Result<LoadedConfig, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("Missing config file: {}", path.display()));
        }
        return load_config(&path);
    }
    let default_path = home_dir()?.join(DEFAULT_CONFIG_REL);
    if default_path.is_file() {
        return load_config(&default_path);
    }
    // No config yet: run on defaults next to where the config would live.
    let base = default_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(LoadedConfig::defaults(&base))
}

/// Reads one line from stdin after printing `prompt` on stderr.
fn prompt_line(prompt: &str) -> Option<String> {
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "{}", prompt);
    let _ = stderr.flush();
    drop(stderr);

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// A passkey from the environment gets a single attempt; otherwise the user is
/// prompted on stdin.
fn passkey_source() -> impl FnMut(u32) -> Option<String> {
    let from_env = env::var(PASSKEY_ENV).ok();
    move |attempt| match &from_env {
        Some(secret) if attempt == 1 => Some(secret.clone()),
        Some(_) => None,
        None => prompt_line("Enter Passkey: "),
    }
}

struct Editor<'a> {
    logger: &'a Logger,
    store: &'a TaskStore,
    history: &'a HistoryStore,
    dispatcher: &'a Dispatcher<'a>,
    passkey: PasskeyFile,
}

impl Editor<'_> {
    fn authorize(&self) -> Result<(), Quit> {
        let configured = self
            .passkey
            .is_configured()
            .map_err(|err| self.fail(&err.to_string()))?;
        if !configured {
            return Ok(());
        }
        authenticate(&self.passkey, passkey_source(), |event| {
            eprintln!("{}", event);
            self.logger.log_transition(&format!("auth event={}", event));
            self.dispatcher.notify(event);
        })
        .map_err(|err| self.fail(&err.to_string()))
    }

    fn fail(&self, message: &str) -> Quit {
        eprintln!("{}", message);
        quit(self.logger, message, 1)
    }

    fn run(&self, command: CliCommand) -> Result<(), Quit> {
        let now = Utc::now();
        match command {
            CliCommand::Daemon { .. } => Ok(()),
            CliCommand::Add {
                description,
                at,
                priority,
            } => {
                self.authorize()?;
                let due = parse_due_time(&at, now.with_timezone(&Local))
                    .map_err(|err| self.fail(&err.to_string()))?;
                let task = add_task(self.store, &description, due, priority, now)
                    .map_err(|err| self.fail(&err.to_string()))?;
                self.logger.log_transition(&format!(
                    "add task={} due={} priority={}",
                    task.id,
                    task.due.to_rfc3339(),
                    task.priority
                ));
                println!("Added task {}.", task.id);
                self.dispatcher.notify(&added_message(&task));
                Ok(())
            }
            CliCommand::List => {
                self.authorize()?;
                let tasks = list_tasks(self.store).map_err(|err| self.fail(&err.to_string()))?;
                print!("{}", render_tasks(&tasks));
                Ok(())
            }
            CliCommand::Edit {
                id,
                description,
                at,
                priority,
            } => {
                self.authorize()?;
                let due = at
                    .map(|at| parse_due_time(&at, now.with_timezone(&Local)))
                    .transpose()
                    .map_err(|err| self.fail(&err.to_string()))?;
                let update = TaskUpdate {
                    description,
                    due,
                    priority,
                };
                let task = edit_task(self.store, id, update, now)
                    .map_err(|err| self.fail(&err.to_string()))?;
                self.logger.log_transition(&format!(
                    "edit task={} due={} notified={}",
                    task.id,
                    task.due.to_rfc3339(),
                    task.notified
                ));
                println!("Updated task {}.", task.id);
                Ok(())
            }
            CliCommand::Delete { id } => {
                self.authorize()?;
                let task = self
                    .dispatcher
                    .delete(id, now)
                    .map_err(|err| self.fail(&err.to_string()))?;
                println!("Deleted task {}.", task.id);
                Ok(())
            }
            CliCommand::History => {
                self.authorize()?;
                let records = self
                    .history
                    .load()
                    .map_err(|err| self.fail(&err.to_string()))?;
                print!("{}", render_history(&records));
                Ok(())
            }
            CliCommand::Passkey {
                action: PasskeyAction::Set,
            } => {
                self.authorize()?;
                let secret = match env::var(NEW_PASSKEY_ENV) {
                    Ok(secret) => Some(secret),
                    Err(_) => prompt_line("New Passkey: "),
                };
                let Some(secret) = secret else {
                    return Err(self.fail("No passkey entered."));
                };
                self.passkey
                    .reset(&secret)
                    .map_err(|err| self.fail(&err.to_string()))?;
                self.logger.log_transition("passkey reset");
                println!("Passkey updated ({}).", self.passkey.path().display());
                Ok(())
            }
        }
    }
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    let loaded = resolve_config(cli.config).map_err(|message| {
        eprintln!("{}", message);
        Quit {
            code: 1,
            reason: message,
        }
    })?;
    for key in &loaded.warnings {
        eprintln!("Warning: unknown config key: {}", key);
    }
    let config = loaded.config;

    let role = match cli.command {
        CliCommand::Daemon { .. } => Role::Daemon,
        _ => Role::Editor,
    };
    let logger = Logger::new(config.log_path.clone(), role);
    let store = TaskStore::new(config.tasks_path.clone(), config.lock_settings());
    let history = HistoryStore::new(config.history_path.clone());
    let sink = HookSink::new(&config.notifications, config.command_timeout());
    let executor = ShellExecutor {
        timeout: config.command_timeout(),
    };
    let dispatcher = Dispatcher {
        store: &store,
        history: &history,
        sink: &sink,
        executor: &executor,
        logger: &logger,
        horizon: config.horizon(),
    };

    if let CliCommand::Daemon { once } = cli.command {
        let interrupt_flag = Arc::new(AtomicBool::new(false));
        if let Err(err) = ctrlc::set_handler({
            let interrupt_flag = Arc::clone(&interrupt_flag);
            move || {
                interrupt_flag.store(true, Ordering::SeqCst);
            }
        }) {
            eprintln!("Failed to set termination handler: {}", err);
        }

        let mut state = DaemonState {
            dispatcher,
            logger: &logger,
            poll_interval: config.poll_interval(),
            interrupt_flag,
            last_good: None,
            degraded: false,
        };
        return run_loop(&mut state, once);
    }

    let editor = Editor {
        logger: &logger,
        store: &store,
        history: &history,
        dispatcher: &dispatcher,
        passkey: PasskeyFile::new(config.passkey_path.clone()),
    };
    editor.run(cli.command)
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            if err.use_stderr() {
                eprintln!("{err}");
            } else {
                print!("{err}");
            }
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    match run_with_args(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
