//! Experiment executors.
//!
//! An executor receives one queued [`StashEntry`], prepares a working tree
//! for it, runs the workload and records the result as an experiment ref.
//! Two variants share the hand-off protocol and differ in who owns the
//! working tree:
//!
//! - [`IsolatedExecutor`] populates a private repository under the temp
//!   area purely by pushing refs into it.
//! - [`InPlaceExecutor`] detaches the base repository's own working tree
//!   and restores the original HEAD on cleanup.
//!
//! Status moves `Uninitialized → Preparing → Running → {Success | Failed}`
//! and is persisted to an infofile at each step so other processes can
//! observe it without taking a lock.

mod in_place;
mod isolated;

pub use in_place::InPlaceExecutor;
pub use isolated::IsolatedExecutor;

use crate::error::{ExpError, Result};
use crate::lock::{RefLocks, RetryPolicy};
use crate::queue::stash_ref;
use crate::refs::{
    branch_ref, temp_ref, write_atomic, EXEC_BASELINE, EXEC_BRANCH, EXEC_CHECKPOINT, EXEC_HEAD,
    EXEC_MERGE,
};
use crate::scm::Scm;
use crate::types::{ExpRefInfo, StashEntry, TaskStatus};
use crate::ObjectId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persisted status of one executor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutorInfo {
    /// Experiment name.
    pub name: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Working tree the workload runs in.
    pub root_dir: PathBuf,
    /// Baseline of the experiment, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_rev: Option<ObjectId>,
    /// Workload exit code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Commit holding the experiment result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_rev: Option<ObjectId>,
    /// PID of the process driving the executor.
    pub pid: u32,
}

impl ExecutorInfo {
    /// Creates an `Uninitialized` record.
    pub fn new(name: &str, root_dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Uninitialized,
            root_dir: root_dir.to_path_buf(),
            baseline_rev: None,
            exit_code: None,
            result_rev: None,
            pid: std::process::id(),
        }
    }

    /// Writes the record as pretty JSON, atomically.
    pub fn dump_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body =
            serde_json::to_vec_pretty(self).map_err(|e| ExpError::Serialization(e.to_string()))?;
        write_atomic(path, &body)
    }

    /// Reads a record written by [`ExecutorInfo::dump_json`].
    pub fn load_json(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ExpError::Deserialization(format!("{}: {}", path.display(), e)))
    }

    /// Moves to `next` and persists the record when an infofile is given.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for steps outside the lifecycle.
    pub fn transition(&mut self, next: TaskStatus, infofile: Option<&Path>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ExpError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(name = %self.name, from = %self.status, to = %next, "Executor status");
        self.status = next;
        match infofile {
            Some(path) => self.dump_json(path),
            None => Ok(()),
        }
    }
}

/// Which executor variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Private repository under the temp area.
    Isolated,
    /// The base repository's own working tree.
    InPlace,
}

/// Capabilities shared by both executor variants.
pub trait Executor {
    /// Current status record.
    fn info(&self) -> &ExecutorInfo;

    /// Hands the entry's refs to the executor and prepares its working tree.
    ///
    /// `Uninitialized → Preparing` is persisted before any repository is
    /// touched.
    fn initialize(
        &mut self,
        base: &dyn Scm,
        entry: &StashEntry,
        infofile: &Path,
        branch: Option<&str>,
    ) -> Result<()>;

    /// Runs the workload in the prepared tree and returns the final status.
    fn run(&mut self, command: &[String], infofile: &Path) -> Result<TaskStatus>;

    /// Records a successful run as `exps/<baseline>/<name>` in `base`.
    ///
    /// Returns `None` if the run did not succeed.
    fn collect_artifacts(&mut self, base: &dyn Scm, name: &str) -> Result<Option<ExpRefInfo>>;

    /// Releases everything the executor holds and deletes `infofile`.
    ///
    /// Safe to call from any state, any number of times.
    fn cleanup(&mut self, infofile: &Path) -> Result<()>;
}

/// Temp refs staged in the base repository for one hand-off attempt.
struct TempRefs {
    head: String,
    merge: String,
    baseline: String,
}

impl TempRefs {
    fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            head: temp_ref(&format!("head-{}", id)),
            merge: temp_ref(&format!("merge-{}", id)),
            baseline: temp_ref(&format!("baseline-{}", id)),
        }
    }

    fn names(&self) -> [&str; 3] {
        [&self.head, &self.merge, &self.baseline]
    }
}

/// Runs steps 1-5 of the hand-off: lease, stage temp refs, push them into
/// `dest` under the stable names, adjust `EXEC_BRANCH`/`EXEC_CHECKPOINT`,
/// drop the temp refs.
///
/// The entry's `exps/stash/<name>` ref is consumed under the same lease, so
/// a second hand-off of the same entry fails with `StashConsumed`.
pub(crate) fn hand_off(
    base: &dyn Scm,
    dest: &dyn Scm,
    entry: &StashEntry,
    branch: Option<&str>,
    locks: &RefLocks,
    policy: &RetryPolicy,
    extra_writes: &[&str],
) -> Result<()> {
    let temps = TempRefs::new();
    let entry_ref = stash_ref(&entry.name);
    let branch_name = branch.map(branch_ref);

    let mut writes: Vec<String> = temps.names().iter().map(|s| s.to_string()).collect();
    writes.push(entry_ref.clone());
    writes.extend(extra_writes.iter().map(|s| s.to_string()));
    let reads: Vec<String> = branch_name.iter().cloned().collect();

    let lease = locks.acquire(reads, writes, policy)?;

    match base.get_ref(&entry_ref)? {
        Some(rev) if rev == entry.stash_rev => {}
        _ => return Err(ExpError::StashConsumed(entry.name.clone())),
    }

    let result = push_temp_refs(base, dest, entry, branch_name.as_deref(), &temps, &entry_ref);

    for name in temps.names() {
        if let Err(e) = base.remove_ref(name) {
            warn!(temp_ref = name, error = %e, "Failed to remove temp ref");
        }
    }
    result?;
    lease.release()?;

    debug!(name = %entry.name, dest = %dest.root_dir().display(), "Handed off experiment refs");
    Ok(())
}

fn push_temp_refs(
    base: &dyn Scm,
    dest: &dyn Scm,
    entry: &StashEntry,
    branch: Option<&str>,
    temps: &TempRefs,
    entry_ref: &str,
) -> Result<()> {
    base.set_ref(&temps.head, entry.head_rev)?;
    base.set_ref(&temps.merge, entry.stash_rev)?;
    base.set_ref(&temps.baseline, entry.baseline_rev)?;

    let mut refspecs = vec![
        (temps.head.clone(), EXEC_HEAD.to_string()),
        (temps.merge.clone(), EXEC_MERGE.to_string()),
        (temps.baseline.clone(), EXEC_BASELINE.to_string()),
    ];
    if let Some(branch) = branch {
        if base.get_ref(branch)?.is_some() {
            refspecs.push((branch.to_string(), branch.to_string()));
        }
    }
    base.push_refspec(dest.root_dir(), &refspecs)?;

    match branch {
        Some(branch) => dest.set_symbolic_ref(EXEC_BRANCH, branch)?,
        None => {
            if dest.remove_ref(EXEC_BRANCH)? {
                debug!("Removed stale EXEC_BRANCH");
            }
        }
    }
    if dest.remove_ref(EXEC_CHECKPOINT)? {
        debug!("Removed stale EXEC_CHECKPOINT");
    }

    base.remove_ref(entry_ref)?;
    Ok(())
}

/// Squash-merges `EXEC_MERGE` into the executor's working tree without
/// committing.
pub(crate) fn merge_exec_merge(scm: &dyn Scm) -> Result<()> {
    let merge_rev = scm
        .get_ref(EXEC_MERGE)?
        .ok_or_else(|| ExpError::RefNotFound(EXEC_MERGE.to_string()))?;
    scm.merge(merge_rev, true, false)
        .map(|_| ())
        .map_err(ExpError::into_merge_failure)
}

/// Spawns the workload in `root` and records its outcome in `info`.
pub(crate) fn run_workload(
    info: &mut ExecutorInfo,
    root: &Path,
    command: &[String],
    infofile: &Path,
) -> Result<TaskStatus> {
    info.transition(TaskStatus::Running, Some(infofile))?;

    let Some((program, args)) = command.split_first() else {
        debug!(name = %info.name, "No workload command, nothing to run");
        info.exit_code = Some(0);
        info.transition(TaskStatus::Success, Some(infofile))?;
        return Ok(info.status);
    };

    info!(name = %info.name, command = ?command, root = %root.display(), "Running experiment");
    let status = Command::new(program)
        .args(args)
        .current_dir(root)
        .env("EXP_NAME", &info.name)
        .env("EXP_ROOT", root)
        .status();

    match status {
        Ok(status) => {
            info.exit_code = status.code();
            let next = if status.success() {
                TaskStatus::Success
            } else {
                TaskStatus::Failed
            };
            info.transition(next, Some(infofile))?;
            Ok(next)
        }
        Err(e) => {
            warn!(name = %info.name, program = %program, error = %e, "Failed to spawn workload");
            info.transition(TaskStatus::Failed, Some(infofile))?;
            Err(e.into())
        }
    }
}

/// Commits the executor's working tree and records the experiment ref in
/// the executor's repository. Advances the requested branch when
/// `EXEC_BRANCH` is set.
pub(crate) fn commit_experiment(scm: &dyn Scm, name: &str) -> Result<(ExpRefInfo, Option<String>)> {
    let baseline = scm
        .get_ref(EXEC_BASELINE)?
        .ok_or_else(|| ExpError::RefNotFound(EXEC_BASELINE.to_string()))?;
    let exp_ref = ExpRefInfo::new(baseline, name)?;

    let rev = scm.commit(&format!("exp: {}", name))?;
    scm.set_ref(&exp_ref.ref_name(), rev)?;

    let branch = scm.get_symbolic_ref(EXEC_BRANCH)?;
    if let Some(branch) = &branch {
        scm.set_ref(branch, rev)?;
    }

    info!(exp = %exp_ref, rev = %rev.short(), "Collected experiment");
    Ok((exp_ref, branch))
}

/// Deletes an infofile and its per-run directory if that is left empty.
pub(crate) fn remove_infofile(infofile: &Path) -> Result<()> {
    match fs::remove_file(infofile) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = infofile.parent() {
        let _ = fs::remove_dir(dir);
    }
    Ok(())
}
