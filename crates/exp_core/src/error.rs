//! Error types for exp_core operations.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for exp_core operations.
#[derive(Error, Debug)]
pub enum ExpError {
    /// The given name or revision does not resolve to an experiment whose
    /// baseline matches the current HEAD.
    #[error("'{0}' does not appear to be an experiment commit")]
    InvalidExperimentReference(String),

    /// A ref lease could not be acquired within the retry budget.
    #[error("unable to acquire lease on {names:?} after {attempts} attempt(s)")]
    LockContention {
        /// Ref names that were requested
        names: Vec<String>,
        /// Number of attempts made
        attempts: u32,
    },

    /// The backend reported a conflict or error during a squash merge.
    #[error("merge failed: {reason}")]
    MergeFailure {
        /// Backend message
        reason: String,
        /// Conflicting paths, when the backend reported them
        paths: Vec<String>,
    },

    /// Re-applying the pre-existing workspace changes on top of an applied
    /// experiment failed. The workspace has already been restored.
    #[error(
        "Experiment changes for '{rev}' conflict with existing workspace changes in {}. \
         The workspace has been restored to its original state.",
        paths.join(", ")
    )]
    ApplyConflict {
        /// Revision or name as given to apply
        rev: String,
        /// Paths changed by both the experiment and the workspace
        paths: Vec<String>,
    },

    /// Backend-level merge conflict (raised by merge and stash apply).
    #[error("merge conflict in {} path(s): {}", paths.len(), paths.join(", "))]
    MergeConflict {
        /// Paths changed differently on both sides
        paths: Vec<String>,
    },

    /// Invalid hex string for ObjectId parsing.
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    /// Serialization error during typed object operations.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error during typed object operations.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Reference not found.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// A revision string did not resolve to any commit.
    #[error("unknown revision: {0}")]
    RevNotFound(String),

    /// A short id matched more than one object.
    #[error("ambiguous revision '{0}'")]
    AmbiguousRev(String),

    /// Error reported by libgit2.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid executor state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state
        from: String,
        /// Target state
        to: String,
    },

    /// Repository is locked by another process.
    #[error("repository locked by another process")]
    RepositoryLocked,

    /// Repository lock is held by a live process.
    #[error("repository lock held by another process (PID: {pid})")]
    RepositoryLockHeld {
        /// Process ID holding the lock
        pid: u32,
    },

    /// The directory is not an experiment repository.
    #[error("not an experiment repository: {}", .0.display())]
    NotARepository(PathBuf),

    /// A queued entry was already handed to an executor.
    #[error("queued experiment '{0}' has already been consumed")]
    StashConsumed(String),

    /// A queued entry with this name already exists.
    #[error("an experiment named '{0}' is already queued")]
    QueueEntryExists(String),

    /// Stash operation on an empty stash stack.
    #[error("no stash entries")]
    NoStashEntries,

    /// Configuration error (loading, parsing, invalid values).
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl ExpError {
    /// Returns true for errors a caller may retry after backing off.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// True if another holder has the whole-repository lock.
    pub fn is_repo_lock_held(&self) -> bool {
        matches!(self, Self::RepositoryLockHeld { .. } | Self::RepositoryLocked)
    }

    /// Wraps a backend error raised during a squash merge as `MergeFailure`,
    /// keeping conflicting paths when the backend reported them.
    pub fn into_merge_failure(self) -> Self {
        match self {
            Self::MergeFailure { .. } => self,
            Self::MergeConflict { paths } => Self::MergeFailure {
                reason: format!("conflict in {}", paths.join(", ")),
                paths,
            },
            other => Self::MergeFailure {
                reason: other.to_string(),
                paths: vec![],
            },
        }
    }

    /// Returns a user-friendly recovery suggestion for the error, if available.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidExperimentReference(_) => Some(
                "Check the name with 'exp list'. Experiments can only be applied on top of their baseline commit.",
            ),
            Self::LockContention { .. } => {
                Some("Another experiment operation is in progress. Retry once it has finished.")
            }
            Self::MergeFailure { .. } => Some(
                "Resolve the conflicting paths manually or re-run the experiment on the current HEAD.",
            ),
            Self::ApplyConflict { .. } => Some(
                "Commit or discard your workspace changes, or re-run apply with --force to keep the experiment version.",
            ),
            Self::RepositoryLocked | Self::RepositoryLockHeld { .. } => Some(
                "Wait for the other process to finish, or manually remove .exp/LOCK if the process is dead.",
            ),
            Self::StashConsumed(_) => {
                Some("This experiment is already running or finished. See 'exp list'.")
            }
            Self::NotARepository(_) => Some("Run 'exp init' first."),
            _ => None,
        }
    }
}

/// Convenience Result type for exp_core operations.
pub type Result<T> = std::result::Result<T, ExpError>;
