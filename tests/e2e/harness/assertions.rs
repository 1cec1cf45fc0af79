use anyhow::Result;
use exp_core::{ExpError, ExpRepo};

/// Declarative assertions on repository and working tree state
pub enum Assertion {
    // Working tree
    FileContent { path: String, content: String },
    FileMissing { path: String },
    WorkspaceClean,
    WorkspaceDirty,
    /// Working tree equals the snapshot taken under this label
    WorkspaceMatches(String),

    // Refs
    RefExists(String),
    RefMissing(String),
    /// Ref points at the commit of the named experiment on the current HEAD
    RefIsExperiment { ref_name: String, name: String },
    NoTempRefs,

    // Stash and queue
    NoStashEntries,
    QueueLength(usize),
    ExperimentCount(usize),

    // Errors
    LastError(ErrorKind),

    // Custom
    Custom(Box<dyn Fn(&ExpRepo) -> Result<()> + Send + Sync>),
}

/// Error kinds a scenario step may expect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidExperimentReference,
    MergeFailure,
    ApplyConflict,
    LockContention,
    StashConsumed,
    Io,
    Any,
}

impl ErrorKind {
    pub fn matches(self, err: &ExpError) -> bool {
        match self {
            Self::InvalidExperimentReference => {
                matches!(err, ExpError::InvalidExperimentReference(_))
            }
            Self::MergeFailure => matches!(err, ExpError::MergeFailure { .. }),
            Self::ApplyConflict => matches!(err, ExpError::ApplyConflict { .. }),
            Self::LockContention => matches!(err, ExpError::LockContention { .. }),
            Self::StashConsumed => matches!(err, ExpError::StashConsumed(_)),
            Self::Io => matches!(err, ExpError::Io(_)),
            Self::Any => true,
        }
    }
}

impl std::fmt::Debug for Assertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileContent { path, content } => {
                write!(f, "FileContent {{ path: {:?}, content: {:?} }}", path, content)
            }
            Self::FileMissing { path } => write!(f, "FileMissing {{ path: {:?} }}", path),
            Self::WorkspaceClean => write!(f, "WorkspaceClean"),
            Self::WorkspaceDirty => write!(f, "WorkspaceDirty"),
            Self::WorkspaceMatches(label) => write!(f, "WorkspaceMatches({:?})", label),
            Self::RefExists(name) => write!(f, "RefExists({:?})", name),
            Self::RefMissing(name) => write!(f, "RefMissing({:?})", name),
            Self::RefIsExperiment { ref_name, name } => {
                write!(f, "RefIsExperiment {{ ref_name: {:?}, name: {:?} }}", ref_name, name)
            }
            Self::NoTempRefs => write!(f, "NoTempRefs"),
            Self::NoStashEntries => write!(f, "NoStashEntries"),
            Self::QueueLength(n) => write!(f, "QueueLength({})", n),
            Self::ExperimentCount(n) => write!(f, "ExperimentCount({})", n),
            Self::LastError(kind) => write!(f, "LastError({:?})", kind),
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}
