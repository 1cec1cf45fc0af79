//! List references.

use anyhow::{Context, Result};
use exp_core::{ExpRepo, RefValue};

/// Print HEAD and every ref with the commit it resolves to.
pub fn run() -> Result<()> {
    let repo = ExpRepo::open(".").context("Not an EXP repository")?;
    let scm = repo.scm();

    match scm.head_ref()? {
        RefValue::Symbolic(target) => match scm.get_ref(&target)? {
            Some(id) => println!("HEAD -> {} ({})", target, id.as_hex()),
            None => println!("HEAD -> {} (unborn)", target),
        },
        RefValue::Direct(id) => println!("HEAD {} (detached)", id.as_hex()),
    }

    for (name, id) in scm.list_refs("")? {
        println!("{} {}", id.as_hex(), name);
    }

    Ok(())
}
