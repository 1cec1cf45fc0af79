//! The well-known experiment ref namespace.
//!
//! Names are relative to `refs/` (`heads/main`, `exps/exec/EXEC_HEAD`).
//! Refs are the wire protocol between the orchestrator and an executor:
//! the orchestrator stages commits under unique temp names, transfers them
//! into the executor's repository under the stable `EXEC_*` names, and the
//! executor publishes results back the same way.

use crate::error::Result;
use crate::ObjectId;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Root of every ref this crate manages.
pub const EXPS_NAMESPACE: &str = "exps";
/// Namespace of the executor handoff refs.
pub const EXEC_NAMESPACE: &str = "exps/exec";
/// Commit the experiment's working changes are based on.
pub const EXEC_HEAD: &str = "exps/exec/EXEC_HEAD";
/// Stash commit carrying the uncommitted diff to replay.
pub const EXEC_MERGE: &str = "exps/exec/EXEC_MERGE";
/// Commit the experiment branches from.
pub const EXEC_BASELINE: &str = "exps/exec/EXEC_BASELINE";
/// Symbolic pointer to the branch an experiment should land on.
pub const EXEC_BRANCH: &str = "exps/exec/EXEC_BRANCH";
/// Latest checkpoint published by a running workload.
pub const EXEC_CHECKPOINT: &str = "exps/exec/EXEC_CHECKPOINT";
/// Last commit applied to the workspace.
pub const EXEC_APPLY: &str = "exps/exec/EXEC_APPLY";
/// Disposable refs used only during handoff.
pub const EXPS_TEMP: &str = "exps/temp";
/// Lock names for queued entries.
pub const EXPS_STASH: &str = "exps/stash";
/// Named lines of history.
pub const HEADS: &str = "heads";

/// Builds a fresh temp ref name. The suffix is unique per call so an
/// interrupted attempt never collides with a later one.
pub fn temp_ref(kind: &str) -> String {
    format!("{}/{}-{}", EXPS_TEMP, kind, Uuid::new_v4().simple())
}

/// Returns the branch ref name for a branch shorthand (`main` → `heads/main`).
pub fn branch_ref(branch: &str) -> String {
    if branch.starts_with("heads/") {
        branch.to_string()
    } else {
        format!("{}/{}", HEADS, branch)
    }
}

/// Returns true if `a` and `b` name the same ref or one contains the other.
///
/// `exps/exec` overlaps `exps/exec/EXEC_HEAD`; `exps/exec` does not overlap
/// `exps/executor`.
pub fn refs_overlap(a: &str, b: &str) -> bool {
    fn within(inner: &str, outer: &str) -> bool {
        inner == outer || (inner.starts_with(outer) && inner[outer.len()..].starts_with('/'))
    }
    within(a, b) || within(b, a)
}

/// HEAD or another ref as stored, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    /// Points at a commit.
    Direct(ObjectId),
    /// Points at another ref by name.
    Symbolic(String),
}

/// Writes a small file atomically using temp file + fsync + rename.
///
/// The temp name is unique per call so concurrent writers never share it.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("ref");
    let tmp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name,
        Uuid::new_v4().simple()
    ));

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    // fsync parent directory (Unix-specific for crash safety)
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }
    }

    Ok(())
}
