//! EXP CLI - Command-line interface for experiment coordination.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use exp_core::ExpError;

mod commands;

#[derive(Parser)]
#[command(name = "exp")]
#[command(about = "Queue, run and apply experiments", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new EXP repository
    Init,
    /// Snapshot the working tree as a commit on HEAD
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,
    },
    /// Queue the current workspace changes as an experiment
    Queue {
        /// Experiment name (generated if omitted)
        #[arg(short, long)]
        name: Option<String>,
        /// Branch to record the experiment result on
        #[arg(short, long)]
        branch: Option<String>,
        /// Command to run for the experiment
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Run a queued experiment
    Run {
        /// Name of the queued experiment
        name: String,
        /// Run in the current working tree instead of a private copy
        #[arg(long)]
        workspace: bool,
    },
    /// Apply an experiment's changes to the working tree
    Apply {
        /// Experiment name, ref or commit id
        rev: String,
        /// Keep the experiment version of conflicting files (default)
        #[arg(long, overrides_with = "no_force")]
        force: bool,
        /// Fail if the experiment conflicts with workspace changes
        #[arg(long = "no-force", overrides_with = "force")]
        no_force: bool,
    },
    /// List queued and completed experiments
    List {
        /// Show experiments of every baseline, not just HEAD
        #[arg(short, long)]
        all: bool,
    },
    /// List all references (HEAD, exps/*, heads/*)
    Refs,
}

fn main() -> Result<()> {
    // Respects RUST_LOG environment variable (e.g., RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init => commands::init::run(),
        Commands::Commit { message } => commands::commit::run(&message),
        Commands::Queue {
            name,
            branch,
            command,
        } => commands::queue::run(name.as_deref(), branch.as_deref(), command),
        Commands::Run { name, workspace } => commands::run::run(&name, workspace),
        Commands::Apply { rev, no_force, .. } => commands::apply::run(&rev, !no_force),
        Commands::List { all } => commands::list::run(all),
        Commands::Refs => commands::refs::run(),
    };

    if let Err(e) = &result {
        let hint = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<ExpError>())
            .and_then(ExpError::recovery_suggestion);
        if let Some(hint) = hint {
            eprintln!("{} {}", style("hint:").yellow().bold(), hint);
        }
    }
    result
}
