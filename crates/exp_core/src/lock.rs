//! Locking facade.
//!
//! Two gates protect a repository:
//! - [`RepoLock`]: the coarse whole-repository lock (`.exp/LOCK`) held for
//!   the duration of a workspace-mutating command such as apply.
//! - [`RefLocks`]: read/write leases over ref names, recorded in a JSON lease
//!   table (`.exp/tmp/rwlock`) that is itself guarded by an advisory file
//!   lock. Writers exclude everyone on overlapping names; readers only
//!   exclude writers.

use crate::error::{ExpError, Result};
use crate::refs::{refs_overlap, write_atomic};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bounded retry with a fixed backoff.
///
/// Passed explicitly to every lease acquisition instead of living in
/// process-wide state.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    retryable: fn(&ExpError) -> bool,
}

impl RetryPolicy {
    /// Retries `LockContention` up to `max_attempts` times, `backoff` apart.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: ExpError::is_lock_contention,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Replaces the retryable-error predicate.
    pub fn with_predicate(mut self, retryable: fn(&ExpError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause between attempts.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && (self.retryable)(&e) => {
                    debug!(attempt, error = %e, "Retrying after backoff");
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(180, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LeaseHolder {
    id: String,
    pid: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseTable {
    #[serde(default)]
    read: BTreeMap<String, Vec<LeaseHolder>>,
    #[serde(default)]
    write: BTreeMap<String, LeaseHolder>,
}

impl LeaseTable {
    fn prune_dead(&mut self) {
        self.write.retain(|name, holder| {
            let alive = is_process_alive(holder.pid);
            if !alive {
                warn!(name = %name, pid = holder.pid, "Dropping stale write lease");
            }
            alive
        });
        for holders in self.read.values_mut() {
            holders.retain(|h| is_process_alive(h.pid));
        }
        self.read.retain(|_, holders| !holders.is_empty());
    }

    fn conflicts(&self, reads: &BTreeSet<String>, writes: &BTreeSet<String>) -> Vec<String> {
        let mut blocked = Vec::new();
        for w in writes {
            let held = self.write.keys().any(|k| refs_overlap(k, w))
                || self.read.keys().any(|k| refs_overlap(k, w));
            if held {
                blocked.push(w.clone());
            }
        }
        for r in reads {
            if self.write.keys().any(|k| refs_overlap(k, r)) {
                blocked.push(r.clone());
            }
        }
        blocked
    }

    fn release(&mut self, id: &str) {
        self.write.retain(|_, holder| holder.id != id);
        for holders in self.read.values_mut() {
            holders.retain(|h| h.id != id);
        }
        self.read.retain(|_, holders| !holders.is_empty());
    }
}

/// Read/write leases over ref names for one repository.
#[derive(Debug, Clone)]
pub struct RefLocks {
    table_path: PathBuf,
    guard_path: PathBuf,
}

impl RefLocks {
    /// Creates a facade storing its lease table in `tmp_dir`.
    pub fn new(tmp_dir: impl AsRef<Path>) -> Self {
        let dir = tmp_dir.as_ref();
        Self {
            table_path: dir.join("rwlock"),
            guard_path: dir.join("rwlock.lock"),
        }
    }

    /// Acquires a scoped lease, retrying per `policy`.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` once the policy's attempts are exhausted.
    pub fn acquire<R, W>(&self, reads: R, writes: W, policy: &RetryPolicy) -> Result<RefLease>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let writes: BTreeSet<String> = writes.into_iter().map(Into::into).collect();
        // A name written by this lease needs no separate read lease.
        let reads: BTreeSet<String> = reads
            .into_iter()
            .map(Into::into)
            .filter(|r| !writes.contains(r))
            .collect();

        policy
            .run(|_| self.try_acquire(&reads, &writes))
            .map_err(|e| match e {
                ExpError::LockContention { names, .. } => ExpError::LockContention {
                    names,
                    attempts: policy.max_attempts(),
                },
                other => other,
            })
    }

    fn try_acquire(&self, reads: &BTreeSet<String>, writes: &BTreeSet<String>) -> Result<RefLease> {
        let id = Uuid::new_v4().simple().to_string();
        self.with_table(|table| {
            table.prune_dead();
            let blocked = table.conflicts(reads, writes);
            if !blocked.is_empty() {
                return Err(ExpError::LockContention {
                    names: blocked,
                    attempts: 1,
                });
            }

            let holder = LeaseHolder {
                id: id.clone(),
                pid: std::process::id(),
            };
            for w in writes {
                table.write.insert(w.clone(), holder.clone());
            }
            for r in reads {
                table.read.entry(r.clone()).or_default().push(holder.clone());
            }
            Ok(())
        })?;

        debug!(?reads, ?writes, lease = %id, "Acquired ref lease");
        Ok(RefLease {
            locks: self.clone(),
            id,
            names: writes.iter().chain(reads.iter()).cloned().collect(),
            released: false,
        })
    }

    /// Runs `f` on the lease table while holding the guard file lock, and
    /// persists the table if `f` succeeds.
    fn with_table<T>(&self, f: impl FnOnce(&mut LeaseTable) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.guard_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.guard_path)?;
        guard.lock_exclusive()?;

        let result = (|| {
            let mut table = self.read_table()?;
            let value = f(&mut table)?;
            let body = serde_json::to_vec_pretty(&table)
                .map_err(|e| ExpError::Serialization(e.to_string()))?;
            write_atomic(&self.table_path, &body)?;
            Ok(value)
        })();

        let _ = guard.unlock();
        result
    }

    fn read_table(&self) -> Result<LeaseTable> {
        match fs::read(&self.table_path) {
            Ok(bytes) if bytes.is_empty() => Ok(LeaseTable::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ExpError::Deserialization(format!(
                    "corrupted lease table {}: {}",
                    self.table_path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LeaseTable::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A held set of ref leases. Released on [`RefLease::release`] or drop.
#[derive(Debug)]
pub struct RefLease {
    locks: RefLocks,
    id: String,
    names: Vec<String>,
    released: bool,
}

impl RefLease {
    /// Names covered by this lease.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Releases the lease, reporting table errors.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        let id = self.id.clone();
        self.locks.with_table(|table| {
            table.release(&id);
            Ok(())
        })
    }
}

impl Drop for RefLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.id.clone();
        if let Err(e) = self.locks.with_table(|table| {
            table.release(&id);
            Ok(())
        }) {
            warn!(lease = %self.id, error = %e, "Failed to release ref lease");
        }
    }
}

/// RAII guard for the whole-repository lock.
///
/// Holds an exclusive lock on `.exp/LOCK`, which contains the PID of the
/// owner. The lock file is removed on drop.
#[derive(Debug)]
pub struct RepoLock {
    /// Wrapped in Option to allow taking ownership in Drop.
    file: Option<File>,
    path: PathBuf,
}

impl RepoLock {
    /// Acquires the repository lock, cleaning up locks left by dead processes.
    pub fn acquire(exp_dir: &Path) -> Result<Self> {
        Self::acquire_with_retry(&exp_dir.join("LOCK"), 0)
    }

    /// Acquires the repository lock, waiting out a live holder for as long
    /// as `policy` allows.
    pub fn acquire_with(exp_dir: &Path, policy: &RetryPolicy) -> Result<Self> {
        policy
            .with_predicate(ExpError::is_repo_lock_held)
            .run(|attempt| {
                let lock = Self::acquire(exp_dir)?;
                if attempt > 1 {
                    debug!(attempt, "Acquired repository lock after waiting");
                }
                Ok(lock)
            })
    }

    fn acquire_with_retry(lock_path: &Path, retry_count: u32) -> Result<Self> {
        // Limit retries to prevent infinite loops
        if retry_count > 2 {
            return Err(ExpError::RepositoryLocked);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                file.flush()?;

                file.try_lock_exclusive()
                    .map_err(|_| ExpError::RepositoryLocked)?;

                Ok(Self {
                    file: Some(file),
                    path: lock_path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Self::handle_existing_lock(lock_path, retry_count)
            }
            Err(e) => Err(ExpError::Io(e)),
        }
    }

    fn handle_existing_lock(lock_path: &Path, retry_count: u32) -> Result<Self> {
        match fs::read_to_string(lock_path) {
            Ok(content) => {
                if let Ok(pid) = content.trim().parse::<u32>() {
                    if is_process_alive(pid) {
                        return Err(ExpError::RepositoryLockHeld { pid });
                    }

                    warn!(pid = pid, "Detected stale lock from dead process, cleaning up");

                    if let Err(e) = fs::remove_file(lock_path) {
                        // Another process may have cleaned it up already
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(ExpError::Io(e));
                        }
                    }
                    return Self::acquire_with_retry(lock_path, retry_count + 1);
                }

                warn!("Lock file has invalid content, attempting cleanup");
                let _ = fs::remove_file(lock_path);
                Self::acquire_with_retry(lock_path, retry_count + 1)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Removed between our create and read
                Self::acquire_with_retry(lock_path, retry_count + 1)
            }
            Err(_) => Err(ExpError::RepositoryLocked),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        // Closing the file releases the advisory lock
        if let Some(file) = self.file.take() {
            drop(file);
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Check if a process with the given PID is still alive.
#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    // /proc/{pid}/stat is more reliable than /proc/{pid} for zombies
    std::path::Path::new(&format!("/proc/{}/stat", pid)).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(true) // Conservative: assume alive if we can't check
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Stale locks are not auto-cleaned here; users can remove them by hand
    true
}
