//! Queue the current workspace changes as an experiment.

use anyhow::{Context, Result};
use console::style;
use exp_core::ExpRepo;

pub fn run(name: Option<&str>, branch: Option<&str>, command: Vec<String>) -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;

    let entry = repo
        .queue()
        .enqueue(name, command, branch)
        .context("Failed to queue experiment")?;

    println!(
        "{} Queued experiment '{}' for future execution.",
        style("✓").green(),
        style(&entry.name).cyan()
    );
    println!("  Baseline: {}", entry.baseline_rev.short());
    if let Some(branch) = &entry.branch {
        println!("  Branch:   {}", branch);
    }
    if !entry.args.is_empty() {
        println!("  Command:  {}", entry.args.join(" "));
    }

    Ok(())
}
