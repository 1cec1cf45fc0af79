//! Core data types shared by the queue and executors.

use crate::error::{ExpError, Result};
use crate::refs::EXPS_NAMESPACE;
use crate::ObjectId;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

/// Executor lifecycle states.
///
/// Serialised as its integer code so observers written against older
/// infofiles keep parsing.
#[repr(u8)]
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Created, nothing touched yet.
    Uninitialized = 0,
    /// Refs are being handed off and the working tree populated.
    Preparing = 1,
    /// The workload is executing.
    Running = 2,
    /// The workload exited successfully.
    Success = 3,
    /// Preparation or the workload failed.
    Failed = 4,
}

impl TaskStatus {
    /// Returns true if `self → next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, next),
            (Uninitialized, Preparing)
                | (Preparing, Running)
                | (Preparing, Failed)
                | (Running, Success)
                | (Running, Failed)
        )
    }

    /// Returns true once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Uninitialized => "uninitialized",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One queued experiment.
///
/// Created when an experiment is queued, consumed exactly once by an
/// executor and never mutated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Experiment name.
    pub name: String,
    /// Commit the working changes are based on.
    pub head_rev: ObjectId,
    /// Commit the experiment branches from.
    pub baseline_rev: ObjectId,
    /// Destination branch, if the result should land on a named line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Commit encoding the uncommitted diff to replay.
    pub stash_rev: ObjectId,
    /// Workload command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// When the entry was queued (Unix seconds).
    pub created_at: i64,
}

/// A completed experiment, stored at `exps/<baseline-hex>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpRefInfo {
    /// Commit the experiment was based on.
    pub baseline: ObjectId,
    /// Experiment name.
    pub name: String,
}

impl ExpRefInfo {
    /// Creates a ref info, rejecting names that cannot be a single ref component.
    pub fn new(baseline: ObjectId, name: &str) -> Result<Self> {
        validate_exp_name(name)?;
        Ok(Self {
            baseline,
            name: name.to_string(),
        })
    }

    /// Parses a full ref name; returns `None` for refs outside the layout.
    pub fn parse(ref_name: &str) -> Option<Self> {
        let rest = ref_name.strip_prefix(EXPS_NAMESPACE)?.strip_prefix('/')?;
        let (baseline, name) = rest.split_once('/')?;
        if name.contains('/') {
            return None;
        }
        let baseline = ObjectId::from_hex(baseline).ok()?;
        Some(Self {
            baseline,
            name: name.to_string(),
        })
    }

    /// Renders the full ref name.
    pub fn ref_name(&self) -> String {
        format!("{}/{}/{}", EXPS_NAMESPACE, self.baseline.as_hex(), self.name)
    }
}

impl fmt::Display for ExpRefInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ref_name())
    }
}

/// Checks an experiment name is usable as a single ref component.
pub(crate) fn validate_exp_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.ends_with(".lock")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ExpError::InvalidExperimentReference(name.to_string()))
    }
}
