use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::task::{Priority, TaskId};

#[derive(Debug, Parser)]
#[command(
    name = "tasky",
    about = "Personal task scheduler with due-time notifications.",
    long_about = "Tasky keeps a list of timed tasks. Editor commands (add, list, edit, delete, history) change the task store; `tasky daemon` polls it and sends a reminder shortly before each task is due, then a due notification, optionally running the task's command.\n\nA description of the form \"-e CMD\" or \"--execute CMD\" runs CMD when the task fires.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Load configuration from PATH instead of ~/.config/tasky/config.yml.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load configuration from PATH instead of ~/.config/tasky/config.yml."
    )]
    pub(crate) config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Poll the task store and dispatch due notifications until terminated.
    Daemon {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Schedule a new task.
    Add {
        #[arg(value_name = "DESCRIPTION", allow_hyphen_values = true)]
        description: String,
        /// Due time: "YYYY-MM-DD HH:MM", "YYYY-MM-DD", "HH:MM", "5:30 PM", "9 AM" or RFC 3339.
        #[arg(short = 'a', long = "at", value_name = "TIME")]
        at: String,
        /// high, medium, low (or 1, 2, 3).
        #[arg(short = 'p', long = "priority", value_name = "PRIORITY", default_value = "medium")]
        priority: Priority,
    },
    /// Show pending tasks, soonest first.
    List,
    /// Change a pending task. A new due time re-arms its notifications.
    Edit {
        #[arg(value_name = "ID")]
        id: TaskId,
        #[arg(short = 'd', long = "description", value_name = "TEXT", allow_hyphen_values = true)]
        description: Option<String>,
        #[arg(short = 'a', long = "at", value_name = "TIME")]
        at: Option<String>,
        #[arg(short = 'p', long = "priority", value_name = "PRIORITY")]
        priority: Option<Priority>,
    },
    /// Remove a pending task; it is kept in the history as manually deleted.
    Delete {
        #[arg(value_name = "ID")]
        id: TaskId,
    },
    /// Show completed and deleted tasks.
    History,
    /// Manage the editor passkey.
    Passkey {
        #[command(subcommand)]
        action: PasskeyAction,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum PasskeyAction {
    /// Set or replace the passkey (the current one is required when set).
    Set,
}
