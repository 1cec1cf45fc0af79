use anyhow::{Context, Result};
use exp_core::{ExpRepo, Scm};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Files and dirty flag of a working tree at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirty: bool,
}

/// Manages isolated test environments with tempfile
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    /// Create an empty workspace
    pub fn empty() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temp directory")?;
        Ok(Self { dir })
    }

    /// Create workspace with initial files
    pub fn with_files(files: HashMap<String, Vec<u8>>) -> Result<Self> {
        let workspace = Self::empty()?;
        for (path, content) in files {
            workspace.write_file(&path, &content)?;
        }
        Ok(workspace)
    }

    /// Get workspace path
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Initialize EXP repository in workspace
    pub fn init_exp(&self) -> Result<ExpRepo> {
        Ok(ExpRepo::init(self.path())?)
    }

    /// Open existing EXP repository
    pub fn open_exp(&self) -> Result<ExpRepo> {
        Ok(ExpRepo::open(self.path())?)
    }

    /// Open the repository over a custom backend
    pub fn open_with_scm(&self, scm: Arc<dyn Scm>) -> Result<ExpRepo> {
        Ok(ExpRepo::with_scm(self.path(), scm)?)
    }

    /// Write file to workspace
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.path().join(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directories for {}", path))?;
        }

        fs::write(&full_path, content)
            .with_context(|| format!("Failed to write file: {}", path))?;

        Ok(())
    }

    /// Read file from workspace
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.path().join(path);
        fs::read(&full_path).with_context(|| format!("Failed to read file: {}", path))
    }

    /// Remove file from workspace
    pub fn remove_file(&self, path: &str) -> Result<()> {
        fs::remove_file(self.path().join(path))
            .with_context(|| format!("Failed to remove file: {}", path))
    }

    /// Check if file exists
    pub fn file_exists(&self, path: &str) -> bool {
        self.path().join(path).exists()
    }

    /// Capture every file outside `.exp/` and `.git/` plus the dirty flag
    pub fn state(&self, repo: &ExpRepo) -> Result<WorkspaceState> {
        let mut files = BTreeMap::new();
        collect_files(self.path(), self.path(), &mut files)?;
        Ok(WorkspaceState {
            files,
            dirty: repo.scm().is_dirty(true)?,
        })
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if dir == root && (entry.file_name() == ".exp" || entry.file_name() == ".git") {
                continue;
            }
            collect_files(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)?
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(rel, fs::read(&path)?);
        }
    }
    Ok(())
}
