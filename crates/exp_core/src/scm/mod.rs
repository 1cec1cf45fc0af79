//! Version-control capability interface.
//!
//! The coordination layer never touches a backend directly; it only uses
//! the operations below. [`GitScm`] is the bundled implementation.

mod git;

pub use git::{GitScm, EXP_DIR};

use crate::error::Result;
use crate::refs::RefValue;
use crate::ObjectId;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Operations a backend must expose.
pub trait Scm: Send + Sync {
    /// Root of the working tree.
    fn root_dir(&self) -> &Path;

    /// Resolves a named ref to a commit. Absence is `Ok(None)`.
    fn get_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Points a ref at a commit (through a symbolic ref, if `name` is one).
    fn set_ref(&self, name: &str, id: ObjectId) -> Result<()>;

    /// Returns the target name if `name` is a symbolic ref.
    fn get_symbolic_ref(&self, name: &str) -> Result<Option<String>>;

    /// Makes `name` a symbolic alias of `target`.
    fn set_symbolic_ref(&self, name: &str, target: &str) -> Result<()>;

    /// Removes a ref; returns whether it existed.
    fn remove_ref(&self, name: &str) -> Result<bool>;

    /// Lists resolved refs under a prefix.
    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>>;

    /// HEAD as stored (symbolic or detached).
    fn head_ref(&self) -> Result<RefValue>;

    /// Rewrites HEAD without touching the working tree.
    fn set_head(&self, value: &RefValue) -> Result<()>;

    /// Current HEAD commit.
    fn get_rev(&self) -> Result<ObjectId>;

    /// True if tracked files differ from HEAD, or, with `untracked_files`,
    /// if untracked files exist.
    fn is_dirty(&self, untracked_files: bool) -> Result<bool>;

    /// True while an uncommitted merge is recorded.
    fn is_merging(&self) -> Result<bool>;

    /// Snapshots working changes onto the stash stack and cleans the tree.
    /// Returns `None` when there was nothing to stash.
    fn stash_push(&self, include_untracked: bool) -> Result<Option<ObjectId>>;

    /// Builds a stash commit without touching the stack or the working tree.
    fn stash_create(&self, include_untracked: bool) -> Result<Option<ObjectId>>;

    /// Replays a stash commit onto the working tree. With `skip_conflicts`
    /// conflicting paths keep the working tree version.
    fn stash_apply(&self, rev: ObjectId, skip_conflicts: bool) -> Result<()>;

    /// Drops the newest stash entry.
    fn stash_drop(&self) -> Result<()>;

    /// Applies then drops the newest stash entry.
    fn stash_pop(&self) -> Result<()>;

    /// Stash stack, newest first.
    fn stash_list(&self) -> Result<Vec<ObjectId>>;

    /// Merges a commit into the working tree. Returns the new commit when
    /// `commit_result` is set.
    fn merge(&self, rev: ObjectId, squash: bool, commit_result: bool) -> Result<Option<ObjectId>>;

    /// Checks out a branch or commit, replacing tracked files.
    fn checkout(&self, target: &str, detach: bool) -> Result<()>;

    /// Clears merge bookkeeping; `hard` also restores tracked files to HEAD.
    fn reset(&self, hard: bool) -> Result<()>;

    /// Commits the whole working tree on HEAD.
    fn commit(&self, message: &str) -> Result<ObjectId>;

    /// Transfers `(source ref, destination ref)` pairs into the repository
    /// rooted at `dest` as one push: every object first, then every ref.
    fn push_refspec(&self, dest: &Path, refspecs: &[(String, String)]) -> Result<()>;

    /// Resolves a human-given name or id to a commit.
    fn resolve_rev(&self, rev: &str) -> Result<ObjectId>;
}

/// HEAD detached onto a commit, restored when the guard is released.
///
/// Only the HEAD pointer is restored; the working tree keeps whatever the
/// detached work left in it.
pub struct DetachedHead {
    scm: Arc<dyn Scm>,
    orig: Option<RefValue>,
}

impl DetachedHead {
    /// Detaches HEAD onto `rev`. With `force` tracked files are reset to it.
    pub fn new(scm: Arc<dyn Scm>, rev: ObjectId, force: bool) -> Result<Self> {
        let orig = scm.head_ref()?;
        scm.set_head(&RefValue::Direct(rev))?;
        let guard = Self {
            scm,
            orig: Some(orig),
        };
        if force {
            // The guard exists already, so a failing reset still restores HEAD.
            guard.scm.reset(true)?;
        }
        debug!(rev = %rev.short(), "Detached HEAD");
        Ok(guard)
    }

    /// HEAD as it was before detaching.
    pub fn original(&self) -> Option<&RefValue> {
        self.orig.as_ref()
    }

    /// Restores the original HEAD. Calling it again is a no-op.
    pub fn restore(&mut self) -> Result<()> {
        if let Some(orig) = self.orig.take() {
            self.scm.set_head(&orig)?;
            debug!(head = ?orig, "Restored HEAD");
        }
        Ok(())
    }
}

impl Drop for DetachedHead {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore HEAD after detached work");
        }
    }
}

impl std::fmt::Debug for DetachedHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedHead")
            .field("root", &self.scm.root_dir())
            .field("orig", &self.orig)
            .finish()
    }
}
