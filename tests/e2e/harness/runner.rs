use super::assertions::{Assertion, ErrorKind};
use super::faulty::{Fault, FaultyScm};
use super::steps::ScenarioStep;
use super::workspace::{TestWorkspace, WorkspaceState};
use anyhow::{anyhow, bail, Context, Result};
use exp_core::{ExecutorKind, ExpError, ExpRepo, GitScm, Scm, EXPS_TEMP};
use std::collections::HashMap;
use std::sync::Arc;

/// Executes scenarios against a real EXP repository
pub struct ScenarioRunner {
    workspace: TestWorkspace,
    repo: ExpRepo,
    scm: Arc<FaultyScm>,
    snapshots: HashMap<String, WorkspaceState>,
    last_error: Option<ExpError>,
    current_step: usize,
}

impl ScenarioRunner {
    /// Create a new runner with initial files
    pub fn new(initial_files: HashMap<String, Vec<u8>>) -> Result<Self> {
        let workspace = TestWorkspace::with_files(initial_files)?;
        workspace.init_exp()?;

        let scm = Arc::new(FaultyScm::new(GitScm::open(workspace.path())?));
        let repo = workspace.open_with_scm(Arc::clone(&scm) as Arc<dyn Scm>)?;

        Ok(Self {
            workspace,
            repo,
            scm,
            snapshots: HashMap::new(),
            last_error: None,
            current_step: 0,
        })
    }

    /// Get current step number
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Execute all steps in sequence
    pub fn execute(&mut self, steps: &[ScenarioStep]) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            self.current_step = i;
            self.execute_step(step)
                .with_context(|| format!("Step {}: {:?}", i, step))?;
        }
        Ok(())
    }

    /// Execute a single step
    fn execute_step(&mut self, step: &ScenarioStep) -> Result<()> {
        match step {
            ScenarioStep::WriteFile { path, content } => self.workspace.write_file(path, content),
            ScenarioStep::RemoveFile { path } => self.workspace.remove_file(path),
            ScenarioStep::Commit { message } => {
                self.repo.scm().commit(message)?;
                Ok(())
            }
            ScenarioStep::ResetHard => Ok(self.repo.scm().reset(true)?),

            ScenarioStep::Queue { name, args, branch } => {
                self.handle_queue(name, args.clone(), branch.as_deref())
            }
            ScenarioStep::Run { name, kind } => self.handle_run(name, *kind),
            ScenarioStep::Apply { rev, force } => {
                self.repo.apply(rev, *force)?;
                Ok(())
            }
            ScenarioStep::ApplyFails { rev, force, kind } => {
                self.handle_apply_fails(rev, *force, *kind)
            }

            ScenarioStep::Inject { fault } => {
                self.handle_inject(*fault);
                Ok(())
            }
            ScenarioStep::ClearFaults => {
                self.scm.clear();
                Ok(())
            }

            ScenarioStep::Snapshot { label } => {
                let state = self.workspace.state(&self.repo)?;
                self.snapshots.insert(label.clone(), state);
                Ok(())
            }

            ScenarioStep::Assert { assertion } => self.handle_assertion(assertion),
        }
    }

    // ===== Action handlers =====

    fn handle_queue(&mut self, name: &str, args: Vec<String>, branch: Option<&str>) -> Result<()> {
        let entry = self.repo.queue().enqueue(Some(name), args, branch)?;
        if entry.name != name {
            bail!("queued as {:?}, expected {:?}", entry.name, name);
        }
        Ok(())
    }

    fn handle_run(&mut self, name: &str, kind: ExecutorKind) -> Result<()> {
        let outcome = self.repo.run_queued(name, kind)?;
        if outcome.exp_ref.is_none() {
            bail!("experiment {} finished as {}", name, outcome.info.status);
        }
        Ok(())
    }

    fn handle_apply_fails(&mut self, rev: &str, force: bool, kind: ErrorKind) -> Result<()> {
        match self.repo.apply(rev, force) {
            Ok(report) => bail!("apply {:?} unexpectedly succeeded: {:?}", rev, report),
            Err(e) if kind.matches(&e) => {
                self.last_error = Some(e);
                Ok(())
            }
            Err(e) => Err(anyhow!("expected {:?}, got {}", kind, e)),
        }
    }

    fn handle_inject(&mut self, fault: Fault) {
        self.scm.inject(fault);
    }

    // ===== Assertion handler =====

    fn handle_assertion(&mut self, assertion: &Assertion) -> Result<()> {
        match assertion {
            Assertion::FileContent { path, content } => {
                let actual = String::from_utf8(self.workspace.read_file(path)?)?;
                if &actual != content {
                    bail!("{}: expected {:?}, got {:?}", path, content, actual);
                }
            }
            Assertion::FileMissing { path } => {
                if self.workspace.file_exists(path) {
                    bail!("{} should not exist", path);
                }
            }
            Assertion::WorkspaceClean => {
                if self.repo.scm().is_dirty(true)? {
                    bail!("working tree is dirty");
                }
            }
            Assertion::WorkspaceDirty => {
                if !self.repo.scm().is_dirty(true)? {
                    bail!("working tree is clean");
                }
            }
            Assertion::WorkspaceMatches(label) => {
                let expected = self
                    .snapshots
                    .get(label)
                    .ok_or_else(|| anyhow!("no snapshot named {:?}", label))?;
                let actual = self.workspace.state(&self.repo)?;
                if &actual != expected {
                    bail!(
                        "working tree differs from snapshot {:?}: expected {:?}, got {:?}",
                        label,
                        expected,
                        actual
                    );
                }
            }
            Assertion::RefExists(name) => {
                if self.repo.scm().get_ref(name)?.is_none() {
                    bail!("ref {} is missing", name);
                }
            }
            Assertion::RefMissing(name) => {
                if let Some(id) = self.repo.scm().get_ref(name)? {
                    bail!("ref {} unexpectedly points at {}", name, id.short());
                }
            }
            Assertion::RefIsExperiment { ref_name, name } => {
                let head = self.repo.scm().get_rev()?;
                let expected = self
                    .repo
                    .list_experiments(Some(head))?
                    .into_iter()
                    .find(|(info, _)| &info.name == name)
                    .map(|(_, commit)| commit)
                    .ok_or_else(|| anyhow!("no experiment {:?} on HEAD", name))?;
                let actual = self.repo.scm().get_ref(ref_name)?;
                if actual != Some(expected) {
                    bail!("{} is {:?}, expected {}", ref_name, actual, expected.short());
                }
            }
            Assertion::NoTempRefs => {
                let temps = self.repo.scm().list_refs(EXPS_TEMP)?;
                if !temps.is_empty() {
                    bail!("temp refs left behind: {:?}", temps);
                }
            }
            Assertion::NoStashEntries => {
                let stash = self.repo.scm().stash_list()?;
                if !stash.is_empty() {
                    bail!("{} stash entries remain", stash.len());
                }
            }
            Assertion::QueueLength(n) => {
                let len = self.repo.queue().list()?.len();
                if len != *n {
                    bail!("queue holds {} entries, expected {}", len, n);
                }
            }
            Assertion::ExperimentCount(n) => {
                let count = self.repo.list_experiments(None)?.len();
                if count != *n {
                    bail!("{} experiments recorded, expected {}", count, n);
                }
            }
            Assertion::LastError(kind) => match &self.last_error {
                Some(e) if kind.matches(e) => {}
                other => bail!("last error {:?} is not {:?}", other, kind),
            },
            Assertion::Custom(check) => check(&self.repo)?,
        }
        Ok(())
    }
}
