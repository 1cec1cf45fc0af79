//! Executor running directly in the base repository's working tree.

use super::{commit_experiment, hand_off, merge_exec_merge, remove_infofile, run_workload};
use super::{Executor, ExecutorInfo};
use crate::error::{ExpError, Result};
use crate::lock::{RefLocks, RetryPolicy};
use crate::refs::{
    EXEC_APPLY, EXEC_BASELINE, EXEC_BRANCH, EXEC_CHECKPOINT, EXEC_HEAD, EXEC_MERGE, EXEC_NAMESPACE,
};
use crate::scm::{DetachedHead, Scm};
use crate::types::{ExpRefInfo, StashEntry, TaskStatus};
use crate::ObjectId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs an experiment on the user's own working tree.
///
/// HEAD is detached onto the experiment's head commit for the duration of
/// the run and restored by [`Executor::cleanup`] (or on drop).
pub struct InPlaceExecutor {
    info: ExecutorInfo,
    scm: Arc<dyn Scm>,
    locks: RefLocks,
    policy: RetryPolicy,
    orig_checkpoint: Option<ObjectId>,
    detached: Option<DetachedHead>,
}

impl InPlaceExecutor {
    /// Creates an executor over `scm`, recording the current checkpoint.
    pub fn new(name: &str, scm: Arc<dyn Scm>, locks: RefLocks, policy: RetryPolicy) -> Result<Self> {
        let orig_checkpoint = scm.get_ref(EXEC_CHECKPOINT)?;
        let root = scm.root_dir().to_path_buf();
        Ok(Self {
            info: ExecutorInfo::new(name, &root),
            scm,
            locks,
            policy,
            orig_checkpoint,
            detached: None,
        })
    }

    /// Checkpoint that was set when the executor was created.
    pub fn original_checkpoint(&self) -> Option<ObjectId> {
        self.orig_checkpoint
    }

    fn prepare(&mut self, base: &dyn Scm, entry: &StashEntry, branch: Option<&str>) -> Result<()> {
        hand_off(
            base,
            self.scm.as_ref(),
            entry,
            branch,
            &self.locks,
            &self.policy,
            &[EXEC_NAMESPACE],
        )?;

        let head = self
            .scm
            .get_ref(EXEC_HEAD)?
            .ok_or_else(|| ExpError::RefNotFound(EXEC_HEAD.to_string()))?;
        self.detached = Some(DetachedHead::new(Arc::clone(&self.scm), head, true)?);
        merge_exec_merge(self.scm.as_ref())
    }
}

impl Executor for InPlaceExecutor {
    fn info(&self) -> &ExecutorInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        base: &dyn Scm,
        entry: &StashEntry,
        infofile: &std::path::Path,
        branch: Option<&str>,
    ) -> Result<()> {
        self.info.baseline_rev = Some(entry.baseline_rev);
        self.info.transition(TaskStatus::Preparing, Some(infofile))?;

        if let Err(e) = self.prepare(base, entry, branch) {
            warn!(name = %self.info.name, error = %e, "Failed to prepare workspace executor");
            self.info.transition(TaskStatus::Failed, Some(infofile))?;
            return Err(e);
        }
        info!(name = %self.info.name, "Prepared workspace executor");
        Ok(())
    }

    fn run(&mut self, command: &[String], infofile: &std::path::Path) -> Result<TaskStatus> {
        let root: PathBuf = self.scm.root_dir().to_path_buf();
        run_workload(&mut self.info, &root, command, infofile)
    }

    fn collect_artifacts(&mut self, _base: &dyn Scm, name: &str) -> Result<Option<ExpRefInfo>> {
        if self.info.status != TaskStatus::Success {
            return Ok(None);
        }

        let baseline = self
            .scm
            .get_ref(EXEC_BASELINE)?
            .ok_or_else(|| ExpError::RefNotFound(EXEC_BASELINE.to_string()))?;
        let mut writes = vec![ExpRefInfo::new(baseline, name)?.ref_name()];
        writes.extend(self.scm.get_symbolic_ref(EXEC_BRANCH)?);

        let lease = self.locks.acquire(Vec::<String>::new(), writes, &self.policy)?;
        let (exp_ref, _) = commit_experiment(self.scm.as_ref(), name)?;
        lease.release()?;

        self.info.result_rev = self.scm.get_ref(&exp_ref.ref_name())?;
        Ok(Some(exp_ref))
    }

    fn cleanup(&mut self, infofile: &std::path::Path) -> Result<()> {
        remove_infofile(infofile)?;

        self.scm.remove_ref(EXEC_BASELINE)?;
        self.scm.remove_ref(EXEC_MERGE)?;
        if self.scm.remove_ref(EXEC_BRANCH)? {
            debug!("Removed EXEC_BRANCH");
        }
        if let Some(mut detached) = self.detached.take() {
            detached.restore()?;
        }

        if let Some(checkpoint) = self.scm.get_ref(EXEC_CHECKPOINT)? {
            if Some(checkpoint) != self.orig_checkpoint {
                self.scm.set_ref(EXEC_APPLY, checkpoint)?;
                info!(checkpoint = %checkpoint.short(), "Published checkpoint as EXEC_APPLY");
            }
        }
        Ok(())
    }
}
