//! Command-line interface for snail
//!
//! This module defines the CLI structure using clap derive macros.
//! Each command group is implemented in its own submodule.

use std::future::Future;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::runtime::Runtime;

use crate::backup::ImportMode;
use crate::config::{default_config_path, Config};
use crate::error::Result;
use crate::output::OutputOptions;
use crate::storage::open_from_config;
use crate::sync::SyncOrchestrator;

mod backup;
mod checkin;
mod project;
mod tag;
mod task;

/// snail - task lists with optimistic sync
///
/// Tasks live in a local SQLite database. Every change is shown at once
/// and rolled back if the store rejects it.
#[derive(Parser, Debug)]
#[command(name = "snail")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, global = true, env = "SNAIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add, list and change tasks
    #[command(subcommand)]
    Task(TaskCommands),

    /// Manage tags and attach them to tasks
    #[command(subcommand)]
    Tag(TagCommands),

    /// Manage projects (lists)
    #[command(subcommand)]
    Project(ProjectCommands),

    /// Export or import a backup archive
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Record a daily check-in
    Checkin {
        /// Day to check in (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
    },

    /// Show the current and longest check-in streaks
    Streak,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a task at the top of its list
    Add {
        title: String,

        #[arg(long)]
        description: Option<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,

        /// Project id or unique prefix
        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        flag: bool,
    },

    /// List tasks in manual order
    List {
        /// Which collection to show
        #[arg(long, value_enum, default_value_t = ListView::Active)]
        view: ListView,

        /// Only tasks of this project (id or unique prefix)
        #[arg(long)]
        project: Option<String>,
    },

    /// Toggle completion
    Done { id: String },

    /// Toggle the flag
    Flag { id: String },

    /// Move to the trash
    Trash { id: String },

    /// Bring back from the trash
    Restore { id: String },

    /// Give up on a task without deleting it
    Abandon { id: String },

    /// Bring back an abandoned task
    Reactivate { id: String },

    /// Delete permanently
    Delete { id: String },

    /// Permanently delete everything in the trash
    EmptyTrash,

    /// Move a task from one position to another
    Move {
        /// Current zero-based position
        from: usize,

        /// New zero-based position
        to: usize,

        /// Project whose list is reordered (id or unique prefix)
        #[arg(long)]
        project: Option<String>,

        /// Reorder the completed tasks instead of the open ones
        #[arg(long)]
        completed: bool,
    },

    /// Show the change history of a task
    History { id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListView {
    Active,
    Trash,
    Abandoned,
}

#[derive(Subcommand, Debug)]
pub enum TagCommands {
    /// Create a tag
    Add {
        name: String,

        /// Scope the tag to a project instead of making it global
        #[arg(long)]
        project: Option<String>,
    },

    /// List tags visible from a project (or global tags)
    List {
        #[arg(long)]
        project: Option<String>,

        /// Include open-task usage counts
        #[arg(long)]
        usage: bool,
    },

    /// Rename a tag
    Rename { id: String, name: String },

    /// Delete a tag and detach it from every task
    Rm { id: String },

    /// Attach a tag to a task
    Attach { task: String, tag: String },

    /// Detach a tag from a task
    Detach { task: String, tag: String },
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Create a project
    Add {
        name: String,

        #[arg(long, default_value = "")]
        icon: String,

        #[arg(long, default_value = "")]
        color: String,
    },

    /// List projects
    List,

    /// Delete a project; its tasks are kept without a project
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// Write every task, project and tag to a .tar.gz archive
    Export { path: PathBuf },

    /// Load an archive written by `backup export`
    Import {
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = ModeArg::Merge)]
        mode: ModeArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Replace,
    Merge,
}

impl From<ModeArg> for ImportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Replace => ImportMode::Replace,
            ModeArg::Merge => ImportMode::Merge,
        }
    }
}

/// Loaded configuration plus output flags.
pub(crate) struct Context {
    pub config: Config,
    pub output: OutputOptions,
}

impl Context {
    fn load(config_path: Option<&Path>, output: OutputOptions) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        // An explicit config must parse; the default one may be absent or stale.
        let config = if config_path.is_some() && path.exists() {
            Config::load(&path)?
        } else {
            Config::load_or_default(&path)
        };
        Ok(Self { config, output })
    }
}

/// A context with an open database and a loaded task store.
pub(crate) struct Session {
    pub ctx: Context,
    pub sync: SyncOrchestrator,
    runtime: Runtime,
}

impl Session {
    fn open(ctx: Context) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let adapter = open_from_config(&ctx.config)?;
        let sync = SyncOrchestrator::from_config(adapter, &ctx.config);
        runtime.block_on(sync.refresh())?;
        Ok(Self { ctx, sync, runtime })
    }

    /// Run `fut` to completion, then wait for background activity writes.
    pub fn block_on<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.runtime.block_on(async {
            let result = fut.await;
            self.sync.flush_activity().await;
            result
        })
    }

    pub fn output(&self) -> OutputOptions {
        self.ctx.output
    }
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let output = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };
        let ctx = Context::load(self.config.as_deref(), output)?;

        match self.command {
            Commands::Task(cmd) => task::run(Session::open(ctx)?, cmd),
            Commands::Tag(cmd) => tag::run(Session::open(ctx)?, cmd),
            Commands::Project(cmd) => project::run(Session::open(ctx)?, cmd),
            Commands::Backup(cmd) => backup::run(Session::open(ctx)?, cmd),
            Commands::Checkin { date } => checkin::run_checkin(&ctx, date.as_deref()),
            Commands::Streak => checkin::run_streak(&ctx),
        }
    }
}

/// Parse a `YYYY-MM-DD` argument.
pub(crate) fn parse_day(flag: &str, raw: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        crate::error::Error::Validation(format!("--{flag} must be YYYY-MM-DD, got '{raw}'"))
    })
}

/// Resolve `raw` to one id from `ids`: an exact match, or a unique prefix.
pub(crate) fn resolve_id<'a>(
    kind: &str,
    raw: &str,
    ids: impl IntoIterator<Item = &'a str>,
) -> Result<String> {
    use crate::error::Error;

    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Validation(format!("{kind} id cannot be empty")));
    }
    let mut matches = Vec::new();
    for id in ids {
        if id == raw {
            return Ok(id.to_string());
        }
        if id.starts_with(raw) {
            matches.push(id);
        }
    }
    match matches.as_slice() {
        [] => Err(Error::NotFound(format!("{kind} {raw}"))),
        [id] => Ok(id.to_string()),
        _ => Err(Error::Validation(format!(
            "{kind} id '{raw}' is ambiguous ({} matches)",
            matches.len()
        ))),
    }
}

/// Short form of an id for human output.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
