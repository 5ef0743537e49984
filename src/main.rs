use std::process::ExitCode;

mod app;
mod auth;
mod cli;
mod config;
mod dispatcher;
mod editor;
mod error;
mod history;
mod lock;
mod logger;
mod notify;
mod run_loop;
mod scanner;
mod shell;
mod store;
mod task;


fn main() -> ExitCode {
    app::main()
}
