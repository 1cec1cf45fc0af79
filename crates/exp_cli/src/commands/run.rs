//! Run a queued experiment.

use anyhow::{Context, Result};
use console::style;
use exp_core::{ExecutorKind, ExpRepo, TaskStatus};
use indicatif::{ProgressBar, ProgressStyle};

/// Claim `name` from the queue and run it to completion.
pub fn run(name: &str, workspace: bool) -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;
    let kind = if workspace {
        ExecutorKind::InPlace
    } else {
        ExecutorKind::Isolated
    };
    tracing::debug!(name, ?kind, "Dispatching queued experiment");

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(format!("Running experiment '{}'...", name));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let outcome = repo.run_queued(name, kind);
    pb.finish_and_clear();
    let outcome = outcome.with_context(|| format!("Failed to run experiment '{}'", name))?;

    match outcome.info.status {
        TaskStatus::Success => {
            println!(
                "{} Experiment '{}' finished.",
                style("✓").green(),
                style(name).cyan()
            );
            if let Some(exp_ref) = &outcome.exp_ref {
                println!("  Ref: {}", exp_ref.ref_name());
            }
            if let Some(rev) = outcome.info.result_rev {
                println!("  Commit: {}", rev.as_hex());
            }
            println!();
            println!("To apply the results to your workspace run:");
            println!("  exp apply {}", name);
            Ok(())
        }
        status => {
            println!(
                "{} Experiment '{}' {}.",
                style("×").red(),
                style(name).cyan(),
                status
            );
            match outcome.info.exit_code {
                Some(code) => anyhow::bail!("experiment command exited with code {}", code),
                None => anyhow::bail!("experiment did not complete"),
            }
        }
    }
}
