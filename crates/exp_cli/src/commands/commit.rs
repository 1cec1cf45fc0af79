//! Commit command for snapshotting the working tree.

use anyhow::{Context, Result};
use exp_core::ExpRepo;

/// Create a new commit from the current working tree.
pub fn run(message: &str) -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;

    let commit_id = repo.scm().commit(message)?;
    println!("Created commit {}", commit_id.as_hex());

    Ok(())
}
