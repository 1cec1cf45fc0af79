//! EXP Core Library
//!
//! Coordination layer for running and applying experiments on top of a
//! git working tree, providing:
//! - A reserved ref namespace and ref-level read/write leases
//! - A queue of pending experiments captured as stash commits
//! - Isolated and in-place executors
//! - An apply workflow that rolls the working tree back on failure
//!
//! # Quick Start
//!
//! ```
//! use exp_core::{ExecutorKind, ExpRepo};
//! use tempfile::TempDir;
//!
//! let tmp = TempDir::new().unwrap();
//! let repo = ExpRepo::init(tmp.path()).unwrap();
//! std::fs::write(tmp.path().join("params.yaml"), "lr: 0.1\n").unwrap();
//! repo.scm().commit("initial").unwrap();
//!
//! // Queue the current workspace changes as an experiment.
//! std::fs::write(tmp.path().join("params.yaml"), "lr: 0.2\n").unwrap();
//! repo.queue().enqueue(Some("exp-1"), vec![], None).unwrap();
//!
//! // Run it in a private working tree and record the result.
//! let outcome = repo.run_queued("exp-1", ExecutorKind::Isolated).unwrap();
//! assert!(outcome.exp_ref.is_some());
//! ```
//!
//! # Features
//!
//! ## Applying Experiments
//!
//! Applied changes land in the working tree uncommitted:
//!
//! ```
//! use exp_core::{ExecutorKind, ExpRepo};
//! use tempfile::TempDir;
//!
//! let tmp = TempDir::new().unwrap();
//! let repo = ExpRepo::init(tmp.path()).unwrap();
//! std::fs::write(tmp.path().join("params.yaml"), "lr: 0.1\n").unwrap();
//! repo.scm().commit("initial").unwrap();
//!
//! std::fs::write(tmp.path().join("params.yaml"), "lr: 0.3\n").unwrap();
//! repo.queue().enqueue(Some("exp-1"), vec![], None).unwrap();
//! repo.scm().reset(true).unwrap();
//! repo.run_queued("exp-1", ExecutorKind::Isolated).unwrap();
//!
//! repo.apply("exp-1", false).unwrap();
//! let params = std::fs::read_to_string(tmp.path().join("params.yaml")).unwrap();
//! assert_eq!(params, "lr: 0.3\n");
//! ```

mod apply;
mod config;
mod error;
mod executor;
mod lock;
mod object_id;
mod queue;
mod refs;
mod repo;
mod scm;
mod types;

pub use apply::{apply, clean_and_pop, ApplyReport, NoopMaterializer, WorkspaceMaterializer};
pub use config::{CacheConfig, Config, ExecConfig, LockConfig};
pub use error::{ExpError, Result};
pub use executor::{Executor, ExecutorInfo, ExecutorKind, InPlaceExecutor, IsolatedExecutor};
pub use lock::{RefLease, RefLocks, RepoLock, RetryPolicy};
pub use object_id::ObjectId;
pub use queue::{stash_ref, ExperimentQueue, PACKED_ARGS_FILE};
pub use refs::{
    branch_ref, refs_overlap, temp_ref, RefValue, EXEC_APPLY, EXEC_BASELINE, EXEC_BRANCH,
    EXEC_CHECKPOINT, EXEC_HEAD, EXEC_MERGE, EXEC_NAMESPACE, EXPS_NAMESPACE, EXPS_STASH, EXPS_TEMP,
    HEADS,
};
pub use repo::{ExpRepo, RunOutcome};
pub use scm::{DetachedHead, GitScm, Scm, EXP_DIR};
pub use types::{ExpRefInfo, StashEntry, TaskStatus};
