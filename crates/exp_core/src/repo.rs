//! Repository handle providing the main experiments API.

use crate::apply::{self, ApplyReport, NoopMaterializer, WorkspaceMaterializer};
use crate::config::Config;
use crate::error::{ExpError, Result};
use crate::executor::{Executor, ExecutorInfo, ExecutorKind, InPlaceExecutor, IsolatedExecutor};
use crate::lock::{RefLocks, RepoLock, RetryPolicy};
use crate::queue::ExperimentQueue;
use crate::refs::EXPS_NAMESPACE;
use crate::queue::stash_ref;
use crate::scm::{GitScm, Scm};
use crate::types::{ExpRefInfo, StashEntry};
use crate::ObjectId;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Experiments repository handle.
///
/// Wraps a backend behind [`Scm`] together with the repository's private
/// `.exp/` directory, configuration, queue and locks.
pub struct ExpRepo {
    root: PathBuf,
    exp_dir: PathBuf,
    scm: Arc<dyn Scm>,
    config: Config,
}

/// Result of [`ExpRepo::run_queued`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final executor record.
    pub info: ExecutorInfo,
    /// Experiment ref recorded for a successful run.
    pub exp_ref: Option<ExpRefInfo>,
}

impl ExpRepo {
    /// Initializes a repository at `path` using the git backend,
    /// creating the git repository if there is none.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use exp_core::ExpRepo;
    ///
    /// let repo = ExpRepo::init(".").unwrap();
    /// ```
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let scm = GitScm::init(path.as_ref())?;
        let exp_dir = scm.exp_dir().to_path_buf();

        fs::create_dir_all(exp_dir.join("queue"))?;
        fs::create_dir_all(exp_dir.join("tmp"))?;
        if !exp_dir.join(crate::config::CONFIG_FILE).exists() {
            Config::default().save(&exp_dir)?;
        }

        Self::with_scm(path, Arc::new(scm))
    }

    /// Opens an existing repository using the git backend.
    ///
    /// # Errors
    ///
    /// Returns `NotARepository` if `.exp/` is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let scm = GitScm::open(path.as_ref())?;
        Self::with_scm(path, Arc::new(scm))
    }

    /// Opens a repository over an arbitrary backend rooted at `path`.
    pub fn with_scm(path: impl AsRef<Path>, scm: Arc<dyn Scm>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let exp_dir = root.join(crate::scm::EXP_DIR);
        if !exp_dir.is_dir() {
            return Err(ExpError::NotARepository(root));
        }
        let config = Config::load(&exp_dir)?;
        Ok(Self {
            root,
            exp_dir,
            scm,
            config,
        })
    }

    /// Working tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Private `.exp/` directory.
    pub fn exp_dir(&self) -> &Path {
        &self.exp_dir
    }

    /// Private temp area (`.exp/tmp`).
    pub fn tmp_dir(&self) -> PathBuf {
        self.exp_dir.join("tmp")
    }

    /// Backend handle.
    pub fn scm(&self) -> &Arc<dyn Scm> {
        &self.scm
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ref-level lease facade of this repository.
    pub fn ref_locks(&self) -> RefLocks {
        RefLocks::new(self.tmp_dir())
    }

    /// Retry policy for ref leases.
    pub fn lock_policy(&self) -> RetryPolicy {
        self.config.lock_policy()
    }

    /// Queue of pending experiments.
    pub fn queue(&self) -> ExperimentQueue {
        ExperimentQueue::new(Arc::clone(&self.scm), &self.exp_dir)
    }

    /// Parent directory of isolated executor roots.
    pub fn executor_dir(&self) -> PathBuf {
        self.config
            .exec
            .tmp_dir
            .clone()
            .unwrap_or_else(|| self.tmp_dir().join("exps"))
    }

    /// Cache directory workloads resolve content from.
    pub fn cache_dir(&self) -> PathBuf {
        self.config
            .cache
            .dir
            .clone()
            .unwrap_or_else(|| self.exp_dir.join("cache"))
    }

    /// Infofile of the executor running `name`.
    pub fn infofile_path(&self, name: &str) -> PathBuf {
        self.tmp_dir()
            .join("exps")
            .join("run")
            .join(name)
            .join(format!("{}.json", name))
    }

    /// Completed experiments, optionally only those on `baseline`.
    pub fn list_experiments(&self, baseline: Option<ObjectId>) -> Result<Vec<(ExpRefInfo, ObjectId)>> {
        Ok(self
            .scm
            .list_refs(EXPS_NAMESPACE)?
            .into_iter()
            .filter_map(|(name, commit)| ExpRefInfo::parse(&name).map(|info| (info, commit)))
            .filter(|(info, _)| baseline.map_or(true, |b| info.baseline == b))
            .collect())
    }

    /// Checks that `commit` is an experiment based on the current HEAD.
    ///
    /// # Errors
    ///
    /// Returns `InvalidExperimentReference` otherwise.
    pub fn check_baseline(&self, commit: ObjectId) -> Result<()> {
        let head = self.scm.get_rev()?;
        if self
            .list_experiments(Some(head))?
            .iter()
            .any(|(_, c)| *c == commit)
        {
            Ok(())
        } else {
            Err(ExpError::InvalidExperimentReference(commit.short()))
        }
    }

    /// Builds an executor for a queued entry.
    pub fn from_stash_entry(&self, kind: ExecutorKind, entry: &StashEntry) -> Result<Box<dyn Executor>> {
        let executor: Box<dyn Executor> = match kind {
            ExecutorKind::Isolated => Box::new(IsolatedExecutor::new(
                &entry.name,
                &self.executor_dir(),
                &self.cache_dir(),
                self.ref_locks(),
                self.lock_policy(),
            )?),
            ExecutorKind::InPlace => Box::new(InPlaceExecutor::new(
                &entry.name,
                Arc::clone(&self.scm),
                self.ref_locks(),
                self.lock_policy(),
            )?),
        };
        Ok(executor)
    }

    /// Runs a queued experiment to completion.
    ///
    /// The queue record is consumed only once hand-off has taken the
    /// entry's stash ref, so a run that fails to acquire its leases leaves
    /// the entry queued for a retry. Cleanup always runs; a cleanup failure
    /// is reported only when the run itself succeeded. In-place runs hold
    /// the repository lock throughout.
    pub fn run_queued(&self, name: &str, kind: ExecutorKind) -> Result<RunOutcome> {
        let _lock = match kind {
            ExecutorKind::InPlace => {
                Some(RepoLock::acquire_with(&self.exp_dir, &self.lock_policy())?)
            }
            ExecutorKind::Isolated => None,
        };

        let queue = self.queue();
        let entry = queue
            .get(name)?
            .ok_or_else(|| ExpError::StashConsumed(name.to_string()))?;
        let infofile = self.infofile_path(&entry.name);
        let mut executor = self.from_stash_entry(kind, &entry)?;

        let result = (|| {
            let handed_off =
                executor.initialize(self.scm.as_ref(), &entry, &infofile, entry.branch.as_deref());
            if self.scm.get_ref(&stash_ref(&entry.name))?.is_none() {
                match queue.claim(&entry.name) {
                    Ok(_) | Err(ExpError::StashConsumed(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            handed_off?;
            executor.run(&entry.args, &infofile)?;
            executor.collect_artifacts(self.scm.as_ref(), &entry.name)
        })();

        let info = executor.info().clone();
        if let Err(e) = executor.cleanup(&infofile) {
            if result.is_ok() {
                return Err(e);
            }
            warn!(name, error = %e, "Executor cleanup failed");
        }

        let exp_ref = result?;
        info!(name, status = %info.status, "Finished experiment run");
        Ok(RunOutcome { info, exp_ref })
    }

    /// Applies an experiment to the working tree.
    pub fn apply(&self, rev: &str, force: bool) -> Result<ApplyReport> {
        apply::apply(self, rev, force, &NoopMaterializer)
    }

    /// Applies an experiment, then runs `materializer` on the result.
    pub fn apply_with(
        &self,
        rev: &str,
        force: bool,
        materializer: &dyn WorkspaceMaterializer,
    ) -> Result<ApplyReport> {
        apply::apply(self, rev, force, materializer)
    }
}
