//! Executor running in a private repository under the temp area.

use super::{commit_experiment, hand_off, merge_exec_merge, remove_infofile, run_workload};
use super::{Executor, ExecutorInfo};
use crate::config::Config;
use crate::error::Result;
use crate::lock::{RefLocks, RetryPolicy};
use crate::refs::{EXEC_BRANCH, EXEC_HEAD};
use crate::scm::{GitScm, Scm};
use crate::types::{ExpRefInfo, StashEntry, TaskStatus};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs an experiment in a brand-new repository that shares nothing with
/// the base repository except objects pushed into it.
pub struct IsolatedExecutor {
    info: ExecutorInfo,
    scm: GitScm,
    locks: RefLocks,
    policy: RetryPolicy,
}

impl IsolatedExecutor {
    /// Creates an empty repository in a fresh directory under `parent`.
    ///
    /// `cache_dir` is written as the new repository's local cache override
    /// so the workload resolves content from the base object store.
    pub fn new(
        name: &str,
        parent: &Path,
        cache_dir: &Path,
        locks: RefLocks,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let root = parent.join(format!("exec-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&root)?;
        let scm = GitScm::init(&root)?;
        Config::write_local_cache_override(scm.exp_dir(), cache_dir)?;

        debug!(name, root = %root.display(), "Created isolated executor");
        Ok(Self {
            info: ExecutorInfo::new(name, &root),
            scm,
            locks,
            policy,
        })
    }

    /// Root of the private working tree.
    pub fn root_dir(&self) -> &Path {
        self.scm.root_dir()
    }

    /// The private repository.
    pub fn scm(&self) -> &GitScm {
        &self.scm
    }

    fn prepare(&mut self, base: &dyn Scm, entry: &StashEntry, branch: Option<&str>) -> Result<()> {
        hand_off(base, &self.scm, entry, branch, &self.locks, &self.policy, &[])?;

        // Outside the lease: nothing here can touch the base repository.
        let head = match branch {
            Some(_) if self.scm.get_ref(EXEC_BRANCH)?.is_some() => EXEC_BRANCH,
            _ => EXEC_HEAD,
        };
        self.scm.checkout(head, true)?;
        merge_exec_merge(&self.scm)
    }
}

impl Executor for IsolatedExecutor {
    fn info(&self) -> &ExecutorInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        base: &dyn Scm,
        entry: &StashEntry,
        infofile: &Path,
        branch: Option<&str>,
    ) -> Result<()> {
        self.info.baseline_rev = Some(entry.baseline_rev);
        self.info.transition(TaskStatus::Preparing, Some(infofile))?;

        if let Err(e) = self.prepare(base, entry, branch) {
            warn!(name = %self.info.name, error = %e, "Failed to prepare isolated executor");
            self.info.transition(TaskStatus::Failed, Some(infofile))?;
            return Err(e);
        }
        info!(name = %self.info.name, root = %self.root_dir().display(), "Prepared isolated executor");
        Ok(())
    }

    fn run(&mut self, command: &[String], infofile: &Path) -> Result<TaskStatus> {
        let root: PathBuf = self.scm.root_dir().to_path_buf();
        run_workload(&mut self.info, &root, command, infofile)
    }

    fn collect_artifacts(&mut self, base: &dyn Scm, name: &str) -> Result<Option<ExpRefInfo>> {
        if self.info.status != TaskStatus::Success {
            return Ok(None);
        }

        let (exp_ref, branch) = commit_experiment(&self.scm, name)?;
        let ref_name = exp_ref.ref_name();

        let mut refspecs = vec![(ref_name.clone(), ref_name.clone())];
        let mut writes = vec![ref_name];
        if let Some(branch) = branch {
            refspecs.push((branch.clone(), branch.clone()));
            writes.push(branch);
        }

        let lease = self.locks.acquire(Vec::<String>::new(), writes, &self.policy)?;
        self.scm.push_refspec(base.root_dir(), &refspecs)?;
        lease.release()?;

        self.info.result_rev = self.scm.get_ref(&exp_ref.ref_name())?;
        Ok(Some(exp_ref))
    }

    fn cleanup(&mut self, infofile: &Path) -> Result<()> {
        remove_infofile(infofile)?;
        let root = self.scm.root_dir();
        match fs::remove_dir_all(root) {
            Ok(()) => debug!(root = %root.display(), "Removed isolated executor root"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
