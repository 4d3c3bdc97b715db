//! Line-oriented terminal view over `synergy_core`.
//!
//! # Responsibility
//! - Forward typed user intents to the session manager and task engine.
//! - Render the latest session/task views after every intent.
//!
//! # Invariants
//! - The CLI never touches stores directly; all state comes from the views.

use clap::{Parser, Subcommand};
use log::info;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use synergy_core::{CoreConfig, SessionView, SynergyApp, SyncState, TaskId, TaskView};

#[derive(Parser)]
#[command(name = "synergy", about = "Personal task tracker", version)]
struct Cli {
    /// JSON config file. In-memory stores are used when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// One line typed at the prompt.
#[derive(Parser, Debug)]
#[command(name = "synergy", no_binary_name = true, disable_version_flag = true)]
struct PromptLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Sign in.
    Login { email: String, password: String },
    /// Create an account and sign in.
    Signup { email: String, password: String },
    /// Toggle between log in and sign up.
    Mode,
    /// Run the current mode.
    Submit { email: String, password: String },
    /// Sign out.
    Logout,
    /// Add a task.
    Add {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Flip completion of a task.
    Toggle { id: TaskId },
    /// Remove a task.
    Delete { id: TaskId },
    /// Show tasks.
    List,
    /// Re-open the task subscription.
    Retry,
    /// Exit.
    #[command(alias = "exit")]
    Quit,
}

/// Parses one prompt line. An empty line lists tasks.
fn parse_command(line: &str) -> Result<Command, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(Command::List);
    }
    PromptLine::try_parse_from(words).map(|parsed| parsed.command)
}

fn render_session(view: &SessionView) -> String {
    let mut out = match &view.principal {
        Some(principal) => format!("signed in as {} ({})", principal.email, principal.uid),
        None => format!("signed out [{}]", view.mode.label()),
    };
    if let Some(error) = &view.auth_error {
        out.push_str(&format!("\n  error: {error}"));
    }
    out
}

fn render_tasks(view: &TaskView) -> String {
    let mut out = match view.state {
        SyncState::Unsubscribed => return "no task list (sign in first)".to_string(),
        SyncState::Subscribing => "loading tasks...".to_string(),
        SyncState::Subscribed => format!(
            "{} remaining, {} done",
            view.remaining_count(),
            view.completed_count()
        ),
    };
    for task in &view.tasks {
        let mark = if task.completed { "x" } else { " " };
        out.push_str(&format!("\n  [{mark}] {} {}", task.id, task.text));
    }
    if let Some(error) = &view.mutation_error {
        out.push_str(&format!("\n  error: {error}"));
    }
    out
}

/// Applies one command. Returns `false` when the loop should stop.
fn run_command(app: &SynergyApp, command: Command, out: &mut impl Write) -> io::Result<bool> {
    let session = app.session();
    let tasks = app.tasks();
    match command {
        Command::Login { email, password } => report(out, session.login(&email, &password))?,
        Command::Signup { email, password } => report(out, session.signup(&email, &password))?,
        Command::Submit { email, password } => report(out, session.submit(&email, &password))?,
        Command::Mode => {
            let mode = session.toggle_mode();
            writeln!(out, "mode: {}", mode.label())?;
        }
        Command::Logout => report(out, session.logout())?,
        Command::Add { text } => report(out, tasks.add_task(&text.join(" ")))?,
        Command::Toggle { id } => report(out, tasks.toggle_complete(id))?,
        Command::Delete { id } => report(out, tasks.delete_task(id))?,
        Command::Retry => report(out, tasks.resubscribe())?,
        Command::List => {}
        Command::Quit => return Ok(false),
    }

    writeln!(out, "{}", render_session(&session.view()))?;
    writeln!(out, "{}", render_tasks(&tasks.view()))?;
    Ok(true)
}

fn report<T, E: std::fmt::Display>(out: &mut impl Write, result: Result<T, E>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) => writeln!(out, "failed: {err}"),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match CoreConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("synergy: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => CoreConfig::default(),
    };

    let app = match SynergyApp::open(config) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("synergy: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!("event=cli_start module=cli status=ok version={}", synergy_core::core_version());

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let storage = match &app.config().db_path {
        Some(path) => path.display().to_string(),
        None => "in-memory".to_string(),
    };
    if let Err(err) = writeln!(
        stdout,
        "synergy {} [{storage}] (type `help`)",
        synergy_core::core_version()
    ) {
        eprintln!("synergy: {err}");
        return ExitCode::FAILURE;
    }

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("synergy: {err}");
                return ExitCode::FAILURE;
            }
        };
        let keep_going = match parse_command(&line) {
            Ok(command) => run_command(&app, command, &mut stdout),
            Err(message) => writeln!(stdout, "{message}").map(|_| true),
        };
        match keep_going {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                eprintln!("synergy: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    app.shutdown();
    ExitCode::SUCCESS
}
