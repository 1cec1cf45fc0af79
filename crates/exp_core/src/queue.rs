//! Queue of experiments waiting for an executor.
//!
//! Each entry is a JSON file under `.exp/queue/`. Queuing also points
//! `exps/stash/<name>` at the entry's stash commit; executors consume that
//! ref under a lease, which is what makes hand-off exactly-once.

use crate::error::{ExpError, Result};
use crate::refs::{write_atomic, EXPS_STASH};
use crate::scm::Scm;
use crate::types::{validate_exp_name, ExpRefInfo, StashEntry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

/// Packed workload arguments of the most recently queued experiment.
pub const PACKED_ARGS_FILE: &str = "repro.dat";

/// Returns the ref that marks a queued entry as not yet consumed.
pub fn stash_ref(name: &str) -> String {
    format!("{}/{}", EXPS_STASH, name)
}

/// Queued experiments of one repository.
pub struct ExperimentQueue {
    scm: Arc<dyn Scm>,
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ExperimentQueue {
    /// Creates a queue stored under `exp_dir`.
    pub fn new(scm: Arc<dyn Scm>, exp_dir: &Path) -> Self {
        Self {
            scm,
            dir: exp_dir.join("queue"),
            tmp_dir: exp_dir.join("tmp"),
        }
    }

    /// Queues the current working changes as a new experiment.
    ///
    /// The working tree is left untouched. Without a name one is generated.
    ///
    /// # Errors
    ///
    /// Returns `QueueEntryExists` if the name is already queued or already
    /// used by an experiment on the current baseline.
    pub fn enqueue(
        &self,
        name: Option<&str>,
        args: Vec<String>,
        branch: Option<&str>,
    ) -> Result<StashEntry> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("exp-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };
        validate_exp_name(&name)?;

        let head_rev = self.scm.get_rev()?;
        if self.entry_path(&name).exists() {
            return Err(ExpError::QueueEntryExists(name));
        }
        let exp_ref = ExpRefInfo::new(head_rev, &name)?;
        if self.scm.get_ref(&exp_ref.ref_name())?.is_some() {
            return Err(ExpError::QueueEntryExists(name));
        }

        let stash_rev = self.scm.stash_create(true)?.unwrap_or(head_rev);
        let entry = StashEntry {
            name: name.clone(),
            head_rev,
            baseline_rev: head_rev,
            branch: branch.map(str::to_string),
            stash_rev,
            args,
            created_at: now_unix(),
        };

        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(&entry)
            .map_err(|e| ExpError::Serialization(e.to_string()))?;
        write_atomic(&self.entry_path(&name), &body)?;
        self.scm.set_ref(&stash_ref(&name), stash_rev)?;
        self.pack_args(&entry.args)?;

        info!(name = %name, stash = %stash_rev.short(), "Queued experiment");
        Ok(entry)
    }

    /// Looks up a queued entry by name.
    pub fn get(&self, name: &str) -> Result<Option<StashEntry>> {
        if validate_exp_name(name).is_err() {
            return Ok(None);
        }
        read_entry(&self.entry_path(name))
    }

    /// Lists queued entries, oldest first.
    pub fn list(&self) -> Result<Vec<StashEntry>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = read_entry(&path)? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Removes an entry from the queue and returns it.
    ///
    /// Only one caller can claim a given entry.
    ///
    /// # Errors
    ///
    /// Returns `StashConsumed` if the entry is gone.
    pub fn claim(&self, name: &str) -> Result<StashEntry> {
        validate_exp_name(name)?;
        let path = self.entry_path(name);
        let claimed = self
            .dir
            .join(format!(".{}.{}.claimed", name, Uuid::new_v4().simple()));

        // rename is atomic, so exactly one claimant wins
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExpError::StashConsumed(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let entry = match read_entry(&claimed) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = fs::remove_file(&claimed);
                return Err(e);
            }
        };
        fs::remove_file(&claimed)?;
        debug!(name, "Claimed queued experiment");
        entry.ok_or_else(|| ExpError::StashConsumed(name.to_string()))
    }

    /// Reads back the packed arguments, if any.
    pub fn packed_args(&self) -> Result<Option<Vec<String>>> {
        match fs::read(self.tmp_dir.join(PACKED_ARGS_FILE)) {
            Ok(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| ExpError::Deserialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the packed arguments file; returns whether it existed.
    pub fn remove_packed_args(&self) -> Result<bool> {
        match fs::remove_file(self.tmp_dir.join(PACKED_ARGS_FILE)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn pack_args(&self, args: &[String]) -> Result<()> {
        fs::create_dir_all(&self.tmp_dir)?;
        let packed =
            postcard::to_allocvec(args).map_err(|e| ExpError::Serialization(e.to_string()))?;
        write_atomic(&self.tmp_dir.join(PACKED_ARGS_FILE), &packed)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

fn read_entry(path: &Path) -> Result<Option<StashEntry>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ExpError::Deserialization(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
