//! Folding a finished experiment back into the user's working tree.
//!
//! The merge runs between a workspace snapshot and its restoration. Every
//! failure funnels through [`clean_and_pop`], so the working tree is back
//! to its pre-apply state (dirty or clean) before the error reaches the
//! caller.

use crate::error::{ExpError, Result};
use crate::lock::RepoLock;
use crate::refs::EXEC_APPLY;
use crate::repo::ExpRepo;
use crate::scm::Scm;
use crate::types::ExpRefInfo;
use crate::ObjectId;
use std::path::Path;
use tracing::{debug, info, warn};

/// Brings tracked outputs in line with the working tree after an apply.
///
/// Called once the experiment's changes are in place. The default does
/// nothing.
pub trait WorkspaceMaterializer {
    /// Materializes outputs under `root`.
    fn materialize(&self, root: &Path) -> Result<()>;
}

/// Materializer that leaves the working tree alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMaterializer;

impl WorkspaceMaterializer for NoopMaterializer {
    fn materialize(&self, _root: &Path) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Revision or name as given.
    pub rev: String,
    /// Commit whose changes were applied.
    pub commit: ObjectId,
    /// True if the commit came from a still-queued entry.
    pub from_queue: bool,
    /// True if pre-existing workspace changes were re-applied on top.
    pub restored_workspace: bool,
}

/// Where an apply target was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedExperiment {
    pub(crate) commit: ObjectId,
    pub(crate) from_queue: bool,
}

/// Applies an experiment's changes to the working tree as uncommitted
/// changes.
///
/// With `force`, paths that conflict between the experiment and
/// pre-existing workspace changes keep the experiment version; without it
/// such conflicts fail with `ApplyConflict`.
pub fn apply(
    repo: &ExpRepo,
    rev: &str,
    force: bool,
    materializer: &dyn WorkspaceMaterializer,
) -> Result<ApplyReport> {
    let _lock = RepoLock::acquire_with(repo.exp_dir(), &repo.lock_policy())?;
    let scm = repo.scm().as_ref();

    let resolved = resolve_experiment(repo, rev)?;
    debug!(rev, commit = %resolved.commit.short(), from_queue = resolved.from_queue, "Resolved experiment");

    let workspace = StashedWorkspace::take(scm)?;
    let restored_workspace = workspace.has_snapshot();

    if let Err(e) = scm.merge(resolved.commit, true, false) {
        workspace.rollback();
        return Err(e.into_merge_failure());
    }
    if let Err(e) = workspace.reapply(force) {
        debug!(error = %e, "Re-applying workspace changes failed");
        workspace.rollback();
        return Err(match e {
            ExpError::MergeConflict { paths } => ExpError::ApplyConflict {
                rev: rev.to_string(),
                paths,
            },
            other => other,
        });
    }

    let finished = scm.reset(false).and_then(|()| {
        if resolved.from_queue && repo.queue().remove_packed_args()? {
            debug!("Removed packed args of applied queue entry");
        }
        materializer.materialize(scm.root_dir())
    });
    if let Err(e) = finished {
        workspace.rollback();
        return Err(e);
    }
    workspace.settle()?;
    scm.set_ref(EXEC_APPLY, resolved.commit)?;

    info!(
        rev,
        commit = %resolved.commit.short(),
        "Changes for experiment '{}' have been applied to your current workspace.",
        rev
    );
    Ok(ApplyReport {
        rev: rev.to_string(),
        commit: resolved.commit,
        from_queue: resolved.from_queue,
        restored_workspace,
    })
}

/// Resolves `rev` to the commit to apply, first match wins:
///
/// 1. a commit whose experiment ref records the current HEAD as baseline,
/// 2. a completed experiment named `rev` on the current baseline,
/// 3. a queued entry named `rev` on the current baseline.
pub(crate) fn resolve_experiment(repo: &ExpRepo, rev: &str) -> Result<ResolvedExperiment> {
    let scm = repo.scm();
    let invalid = || ExpError::InvalidExperimentReference(rev.to_string());

    match scm.resolve_rev(rev) {
        Ok(commit) => {
            return match repo.check_baseline(commit) {
                Ok(()) => Ok(ResolvedExperiment {
                    commit,
                    from_queue: false,
                }),
                Err(ExpError::InvalidExperimentReference(_)) => Err(invalid()),
                Err(e) => Err(e),
            };
        }
        Err(
            ExpError::RevNotFound(_)
            | ExpError::AmbiguousRev(_)
            | ExpError::InvalidHex(_),
        ) => {}
        Err(e) => return Err(e),
    }

    let baseline = scm.get_rev()?;

    let named: Vec<(ExpRefInfo, ObjectId)> = repo
        .list_experiments(None)?
        .into_iter()
        .filter(|(info, _)| info.name == rev)
        .collect();
    if !named.is_empty() {
        return named
            .into_iter()
            .find(|(info, _)| info.baseline == baseline)
            .map(|(_, commit)| ResolvedExperiment {
                commit,
                from_queue: false,
            })
            .ok_or_else(invalid);
    }

    match repo.queue().get(rev)? {
        Some(entry) if entry.baseline_rev == baseline => Ok(ResolvedExperiment {
            commit: entry.stash_rev,
            from_queue: true,
        }),
        _ => Err(invalid()),
    }
}

/// Reverts the working tree and pops the pre-apply snapshot if there is
/// one.
///
/// Files left behind by the hard reset are untracked files created by the
/// failed operation. They are stashed and dropped, i.e. discarded, before
/// the snapshot is popped.
pub fn clean_and_pop(scm: &dyn Scm, has_snapshot: bool) -> Result<()> {
    scm.reset(true)?;
    if scm.is_dirty(true)? {
        debug!("Discarding untracked files left by the failed apply");
        scm.stash_push(true)?;
        scm.stash_drop()?;
    }
    if has_snapshot {
        scm.stash_pop()?;
    }
    Ok(())
}

/// Workspace changes stashed for the duration of an apply.
///
/// Dropped without being settled, it rolls the working tree back.
struct StashedWorkspace<'a> {
    scm: &'a dyn Scm,
    stash_rev: Option<ObjectId>,
    settled: bool,
}

impl<'a> StashedWorkspace<'a> {
    fn take(scm: &'a dyn Scm) -> Result<Self> {
        let stash_rev = if scm.is_dirty(true)? {
            debug!("Stashing workspace");
            scm.stash_push(true)?
        } else {
            None
        };
        Ok(Self {
            scm,
            stash_rev,
            settled: false,
        })
    }

    fn has_snapshot(&self) -> bool {
        self.stash_rev.is_some()
    }

    /// Re-applies the snapshot on top of the merged experiment.
    ///
    /// The snapshot stays on the stash stack until [`Self::settle`], so a
    /// later rollback can still pop it.
    fn reapply(&self, force: bool) -> Result<()> {
        let Some(stash_rev) = self.stash_rev else {
            return Ok(());
        };
        self.scm.reset(false)?;
        self.scm.stash_apply(stash_rev, force)
    }

    /// Drops the snapshot once the apply can no longer fail.
    fn settle(mut self) -> Result<()> {
        self.settled = true;
        if self.stash_rev.is_some() {
            self.scm.stash_drop()?;
        }
        Ok(())
    }

    fn rollback(mut self) {
        self.settled = true;
        self.rollback_now();
    }

    fn rollback_now(&self) {
        if let Err(e) = clean_and_pop(self.scm, self.stash_rev.is_some()) {
            warn!(error = %e, "Failed to restore the workspace; check 'exp' stash entries");
        }
    }
}

impl Drop for StashedWorkspace<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.rollback_now();
        }
    }
}
