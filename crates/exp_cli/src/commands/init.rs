//! Initialize a new EXP repository.

use anyhow::{Context, Result};
use exp_core::ExpRepo;

/// Initialize a new EXP repository in the current directory.
pub fn run() -> Result<()> {
    let repo = ExpRepo::init(".").context("Failed to initialize EXP repository")?;

    println!("Initialized EXP repository in .exp/");
    println!();
    println!("Directory structure:");
    println!("  .git/           - Commits, branches and experiment refs");
    println!("  .exp/queue/     - Queued experiments");
    println!("  .exp/tmp/       - Locks and executor roots (excluded from git)");
    println!();
    println!("Configuration written to .exp/config.toml");
    println!(
        "Experiments run in {}",
        repo.executor_dir().display()
    );

    Ok(())
}
