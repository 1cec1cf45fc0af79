//! Apply an experiment to the working tree.

use anyhow::{Context, Result};
use console::style;
use exp_core::ExpRepo;

pub fn run(rev: &str, force: bool) -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;

    let report = repo.apply(rev, force)?;

    println!(
        "{} Changes for experiment '{}' have been applied to your current workspace.",
        style("✓").green(),
        style(&report.rev).cyan()
    );
    println!("  Commit: {}", report.commit.as_hex());
    if report.restored_workspace {
        println!("  Your previous workspace changes were re-applied on top.");
    }

    Ok(())
}
