//! List queued and completed experiments.

use anyhow::{Context, Result};
use chrono::DateTime;
use console::style;
use exp_core::ExpRepo;

/// Print queued entries and the experiments of the current baseline.
pub fn run(all: bool) -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;
    let head = repo.scm().get_rev().ok();

    let queued = repo.queue().list()?;
    println!("{}", style("Queued:").bold());
    if queued.is_empty() {
        println!("  (none)");
    }
    for entry in &queued {
        let created = DateTime::from_timestamp(entry.created_at, 0)
            .unwrap_or_default()
            .format("%Y-%m-%d %H:%M:%S UTC");
        println!(
            "  {} {} on {}  {}",
            style(&entry.name).cyan(),
            created,
            entry.baseline_rev.short(),
            entry.args.join(" ")
        );
    }

    let baseline = if all { None } else { head };
    let done = if all || head.is_some() {
        repo.list_experiments(baseline)?
    } else {
        Vec::new()
    };

    println!();
    println!("{}", style("Experiments:").bold());
    if done.is_empty() {
        println!("  (none)");
    }
    for (info, commit) in &done {
        let marker = if Some(info.baseline) == head {
            style("*").green()
        } else {
            style(" ").dim()
        };
        println!(
            "{} {} {} (baseline {})",
            marker,
            style(&info.name).cyan(),
            commit.short(),
            info.baseline.short()
        );
    }

    Ok(())
}
