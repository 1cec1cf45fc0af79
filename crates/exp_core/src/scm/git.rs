//! Git backend over libgit2.
//!
//! The index always mirrors HEAD; working changes live only in the working
//! tree, so a file is tracked exactly when HEAD's tree lists it. Merges and
//! stash replays are computed on trees in memory and written to the
//! working tree only when they succeed.

use super::Scm;
use crate::error::{ExpError, Result};
use crate::refs::{branch_ref, refs_overlap, RefValue};
use crate::ObjectId;
use git2::build::CheckoutBuilder;
use git2::{
    AutotagOption, Commit, Delta, ErrorCode, FetchOptions, FileFavor, FileMode, Index, IndexAddOption,
    IndexEntry, IndexTime, MergeOptions, ObjectType, Oid, ReferenceType, Repository,
    RepositoryInitOptions, RepositoryState, ResetType, Signature, StashFlags, StatusOptions, Tree,
    TreeWalkMode, TreeWalkResult,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Private data directory at the root of every repository.
pub const EXP_DIR: &str = ".exp";

const DEFAULT_BRANCH: &str = "main";
const REFS_PREFIX: &str = "refs/";
const HEAD: &str = "HEAD";
const STASH_REF: &str = "stash";
const MAX_SYMBOLIC_DEPTH: usize = 5;
const STAGE_MASK: u16 = 0x3000;
const FALLBACK_NAME: &str = "exp";
const FALLBACK_EMAIL: &str = "exp@localhost";

/// Working tree + `.git/` repository, with `.exp/` excluded from it.
pub struct GitScm {
    root: PathBuf,
    exp_dir: PathBuf,
    repo: Mutex<Repository>,
}

impl GitScm {
    /// Opens the git repository at `root`, creating one with an unborn
    /// `main` branch if there is none, and sets up `.exp/`.
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let repo = match Repository::open(root) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let mut opts = RepositoryInitOptions::new();
                opts.initial_head(DEFAULT_BRANCH);
                let repo = Repository::init_opts(root, &opts)?;
                info!(root = %root.display(), "Initialized repository");
                repo
            }
            Err(e) => return Err(e.into()),
        };

        fs::create_dir_all(root.join(EXP_DIR))?;
        exclude_exp_dir(&repo)?;
        Ok(Self::from_repo(root, repo))
    }

    /// Opens the git repository rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `NotARepository` if `root` holds no git repository.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let repo = Repository::open(root).map_err(|e| match e.code() {
            ErrorCode::NotFound => ExpError::NotARepository(root.to_path_buf()),
            _ => e.into(),
        })?;
        Ok(Self::from_repo(root, repo))
    }

    fn from_repo(root: &Path, repo: Repository) -> Self {
        Self {
            root: root.to_path_buf(),
            exp_dir: root.join(EXP_DIR),
            repo: Mutex::new(repo),
        }
    }

    /// The private `.exp/` directory.
    pub fn exp_dir(&self) -> &Path {
        &self.exp_dir
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads one file's contents as recorded by a commit.
    pub fn read_file_at(&self, id: ObjectId, path: &str) -> Result<Option<Vec<u8>>> {
        let repo = self.repo();
        let tree = repo.find_commit(id.oid())?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = repo.find_blob(entry.id())?;
        Ok(Some(blob.content().to_vec()))
    }

    /// Parent commits of `id`, first parent first.
    pub fn parents(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let repo = self.repo();
        let commit = repo.find_commit(id.oid())?;
        Ok(commit.parent_ids().map(ObjectId::from).collect())
    }

    /// Merges `theirs` into the working tree against `base`, leaving HEAD
    /// and the index alone. Returns the merged tree.
    fn merge_into_worktree(
        &self,
        repo: &Repository,
        base: &Tree<'_>,
        theirs: &Tree<'_>,
        skip_conflicts: bool,
    ) -> Result<Oid> {
        let ours = repo.find_tree(worktree_tree(repo, &self.root, true)?)?;

        let mut opts = MergeOptions::new();
        if skip_conflicts {
            opts.file_favor(FileFavor::Ours);
        }
        let mut index = repo.merge_trees(base, &ours, theirs, Some(&opts))?;

        if index.has_conflicts() {
            let conflicts = collect_conflicts(&index)?;
            if !skip_conflicts {
                return Err(ExpError::MergeConflict {
                    paths: conflicts.into_iter().map(|(path, _)| path).collect(),
                });
            }
            debug!(paths = ?conflicts.iter().map(|(p, _)| p).collect::<Vec<_>>(), "Keeping working tree version of conflicting paths");
            for (path, ours) in conflicts {
                index.remove_path(Path::new(&path))?;
                if let Some(mut entry) = ours {
                    entry.flags &= !STAGE_MASK;
                    index.add(&entry)?;
                }
            }
        }

        let merged = index.write_tree_to(repo)?;
        let written = write_worktree(repo, &self.root, &ours, &repo.find_tree(merged)?)?;
        debug!(files = written, "Updated working tree");
        Ok(merged)
    }
}

impl std::fmt::Debug for GitScm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitScm").field("root", &self.root).finish()
    }
}

impl Scm for GitScm {
    fn root_dir(&self) -> &Path {
        &self.root
    }

    fn get_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        let repo = self.repo();
        resolve_ref(&repo, name)
    }

    fn set_ref(&self, name: &str, id: ObjectId) -> Result<()> {
        let repo = self.repo();
        set_ref_in(&repo, name, id)
    }

    fn get_symbolic_ref(&self, name: &str) -> Result<Option<String>> {
        let repo = self.repo();
        Ok(symbolic_target(&repo, &full_name(name))?.map(|t| short_name(&t)))
    }

    fn set_symbolic_ref(&self, name: &str, target: &str) -> Result<()> {
        let repo = self.repo();
        repo.reference_symbolic(&full_name(name), &full_name(target), true, "exp: symbolic ref")?;
        Ok(())
    }

    fn remove_ref(&self, name: &str) -> Result<bool> {
        let repo = self.repo();
        let mut reference = match repo.find_reference(&full_name(name)) {
            Ok(r) => r,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        reference.delete()?;
        Ok(true)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        let repo = self.repo();
        let mut refs = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            let Some(name) = reference.name().and_then(|n| n.strip_prefix(REFS_PREFIX)) else {
                continue;
            };
            // The stash stack is exposed through `stash_list`.
            if name == STASH_REF || !(prefix.is_empty() || refs_overlap(name, prefix)) {
                continue;
            }
            let name = name.to_string();
            let target = match reference.resolve() {
                Ok(resolved) => resolved.target(),
                Err(e) if e.code() == ErrorCode::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            if let Some(oid) = target {
                refs.push((name, ObjectId::from(oid)));
            }
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    fn head_ref(&self) -> Result<RefValue> {
        let repo = self.repo();
        let head = repo.find_reference(HEAD)?;
        match head.kind() {
            Some(ReferenceType::Symbolic) => {
                let target = head
                    .symbolic_target()
                    .ok_or_else(|| ExpError::RefNotFound(HEAD.to_string()))?;
                Ok(RefValue::Symbolic(short_name(target)))
            }
            _ => head
                .target()
                .map(|oid| RefValue::Direct(oid.into()))
                .ok_or_else(|| ExpError::RefNotFound(HEAD.to_string())),
        }
    }

    fn set_head(&self, value: &RefValue) -> Result<()> {
        let repo = self.repo();
        match value {
            RefValue::Direct(id) => repo.set_head_detached(id.oid())?,
            RefValue::Symbolic(target) => {
                repo.reference_symbolic(HEAD, &full_name(target), true, "exp: set HEAD")?;
            }
        }
        sync_index_to_head(&repo)
    }

    fn get_rev(&self) -> Result<ObjectId> {
        let repo = self.repo();
        let rev = head_commit(&repo)?
            .map(|c| c.id().into())
            .ok_or_else(|| ExpError::RevNotFound(HEAD.to_string()));
        rev
    }

    fn is_dirty(&self, untracked_files: bool) -> Result<bool> {
        let repo = self.repo();
        let statuses = repo.statuses(Some(&mut status_options(untracked_files)))?;
        Ok(statuses.iter().any(|e| !e.status().is_ignored()))
    }

    fn is_merging(&self) -> Result<bool> {
        Ok(self.repo().state() == RepositoryState::Merge)
    }

    fn stash_push(&self, include_untracked: bool) -> Result<Option<ObjectId>> {
        let mut repo = self.repo();
        let sig = signature(&repo)?;
        let flags = if include_untracked {
            StashFlags::INCLUDE_UNTRACKED
        } else {
            StashFlags::DEFAULT
        };
        match repo.stash_save(&sig, "exp: workspace snapshot", Some(flags)) {
            Ok(oid) => {
                repo.cleanup_state()?;
                debug!(stash = %ObjectId::from(oid).short(), include_untracked, "Pushed stash");
                Ok(Some(oid.into()))
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stash_create(&self, include_untracked: bool) -> Result<Option<ObjectId>> {
        let repo = self.repo();
        let statuses = repo.statuses(Some(&mut status_options(include_untracked)))?;
        if !statuses.iter().any(|e| !e.status().is_ignored()) {
            return Ok(None);
        }
        drop(statuses);

        let tree = repo.find_tree(worktree_tree(&repo, &self.root, include_untracked)?)?;
        let head = head_commit(&repo)?;
        let parents: Vec<&Commit<'_>> = head.iter().collect();
        let sig = signature(&repo)?;
        let message = match &head {
            Some(h) => format!("WIP on {}", ObjectId::from(h.id()).short()),
            None => "WIP".to_string(),
        };
        let oid = repo.commit(None, &sig, &sig, &message, &tree, &parents)?;
        debug!(stash = %ObjectId::from(oid).short(), "Created stash commit");
        Ok(Some(oid.into()))
    }

    fn stash_apply(&self, rev: ObjectId, skip_conflicts: bool) -> Result<()> {
        let repo = self.repo();
        apply_stash(self, &repo, rev, skip_conflicts)
    }

    fn stash_drop(&self) -> Result<()> {
        let mut repo = self.repo();
        match repo.stash_drop(0) {
            Ok(()) => {
                debug!("Dropped stash");
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::NotFound => Err(ExpError::NoStashEntries),
            Err(e) => Err(e.into()),
        }
    }

    fn stash_pop(&self) -> Result<()> {
        let mut repo = self.repo();
        let top = stash_ids(&mut repo)?
            .first()
            .copied()
            .ok_or(ExpError::NoStashEntries)?;
        apply_stash(self, &repo, top, false)?;
        repo.stash_drop(0)?;
        debug!(stash = %top.short(), "Popped stash");
        Ok(())
    }

    fn stash_list(&self) -> Result<Vec<ObjectId>> {
        let mut repo = self.repo();
        stash_ids(&mut repo)
    }

    fn merge(&self, rev: ObjectId, squash: bool, commit_result: bool) -> Result<Option<ObjectId>> {
        let repo = self.repo();
        let their = repo.find_commit(rev.oid())?;
        let head = head_commit(&repo)?;

        let base = match &head {
            Some(h) if h.id() == rev.oid() || repo.graph_descendant_of(h.id(), rev.oid())? => {
                debug!(rev = %rev.short(), "Already up to date");
                return Ok(None);
            }
            Some(h) => match repo.merge_base(h.id(), rev.oid()) {
                Ok(b) => repo.find_commit(b)?.tree()?,
                Err(e) if e.code() == ErrorCode::NotFound => empty_tree(&repo)?,
                Err(e) => return Err(e.into()),
            },
            None => empty_tree(&repo)?,
        };

        let merged = self.merge_into_worktree(&repo, &base, &their.tree()?, false)?;

        if commit_result {
            let tree = repo.find_tree(merged)?;
            let mut parents: Vec<&Commit<'_>> = head.iter().collect();
            if !squash {
                parents.push(&their);
            }
            let sig = signature(&repo)?;
            let oid = repo.commit(
                Some(HEAD),
                &sig,
                &sig,
                &format!("Merge {}", rev.short()),
                &tree,
                &parents,
            )?;
            let mut index = repo.index()?;
            index.read_tree(&tree)?;
            index.write()?;
            repo.cleanup_state()?;
            debug!(rev = %rev.short(), commit = %ObjectId::from(oid).short(), "Merged and committed");
            return Ok(Some(oid.into()));
        }

        fs::write(repo.path().join("MERGE_HEAD"), format!("{}\n", rev.as_hex()))?;
        debug!(rev = %rev.short(), squash, "Merged without commit");
        Ok(None)
    }

    fn checkout(&self, target: &str, detach: bool) -> Result<()> {
        let repo = self.repo();
        let branch = full_name(&branch_ref(target));

        let (commit, symbolic) = if detach {
            (resolve_commit(&repo, target)?, None)
        } else {
            match repo.find_reference(&branch) {
                Ok(r) => (r.peel_to_commit()?, Some(branch)),
                Err(e) if e.code() == ErrorCode::NotFound => (resolve_commit(&repo, target)?, None),
                Err(e) => return Err(e.into()),
            }
        };

        let mut opts = CheckoutBuilder::new();
        opts.force();
        repo.checkout_tree(commit.as_object(), Some(&mut opts))?;
        match symbolic {
            Some(branch) => {
                repo.reference_symbolic(HEAD, &branch, true, "exp: checkout")?;
            }
            None => repo.set_head_detached(commit.id())?,
        }
        repo.cleanup_state()?;
        debug!(target, detach, commit = %ObjectId::from(commit.id()).short(), "Checked out");
        Ok(())
    }

    fn reset(&self, hard: bool) -> Result<()> {
        let repo = self.repo();
        repo.cleanup_state()?;
        if let Some(head) = head_commit(&repo)? {
            let kind = if hard { ResetType::Hard } else { ResetType::Mixed };
            repo.reset(head.as_object(), kind, None)?;
        }
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<ObjectId> {
        let repo = self.repo();
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let head = head_commit(&repo)?;
        let parents: Vec<&Commit<'_>> = head.iter().collect();
        let sig = signature(&repo)?;
        let oid = repo.commit(Some(HEAD), &sig, &sig, message, &tree, &parents)?;
        repo.cleanup_state()?;
        debug!(commit = %ObjectId::from(oid).short(), files = index.len(), "Committed");
        Ok(oid.into())
    }

    fn push_refspec(&self, dest: &Path, refspecs: &[(String, String)]) -> Result<()> {
        let repo = self.repo();

        let mut updates = Vec::with_capacity(refspecs.len());
        for (src, dst) in refspecs {
            let id = resolve_ref(&repo, src)?.ok_or_else(|| ExpError::RefNotFound(src.clone()))?;
            updates.push((src, dst, id));
        }

        if same_dir(dest, &self.root) {
            for (_, dst, id) in &updates {
                set_ref_in(&repo, dst, *id)?;
            }
            debug!(refs = updates.len(), "Updated refs in place");
            return Ok(());
        }

        // libgit2 refuses to push into a non-bare repository, so the
        // destination fetches from us instead.
        let dest_repo = Repository::open(dest).map_err(|e| match e.code() {
            ErrorCode::NotFound => ExpError::NotARepository(dest.to_path_buf()),
            _ => e.into(),
        })?;
        let url = repo
            .path()
            .to_str()
            .ok_or_else(|| ExpError::NotARepository(self.root.clone()))?;
        let specs: Vec<String> = updates
            .iter()
            .map(|(src, dst, _)| format!("+{}:{}", full_name(src), full_name(dst)))
            .collect();

        let mut remote = dest_repo.remote_anonymous(url)?;
        let mut opts = FetchOptions::new();
        opts.update_fetchhead(false).download_tags(AutotagOption::None);
        remote.fetch(&specs, Some(&mut opts), Some("exp: push"))?;

        debug!(dest = %dest.display(), refs = updates.len(), "Pushed refspecs");
        Ok(())
    }

    fn resolve_rev(&self, rev: &str) -> Result<ObjectId> {
        let repo = self.repo();
        resolve_commit(&repo, rev).map(|c| c.id().into())
    }
}

fn full_name(name: &str) -> String {
    if name == HEAD || name.starts_with(REFS_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", REFS_PREFIX, name)
    }
}

fn short_name(full: &str) -> String {
    full.strip_prefix(REFS_PREFIX).unwrap_or(full).to_string()
}

fn symbolic_target(repo: &Repository, full: &str) -> Result<Option<String>> {
    match repo.find_reference(full) {
        Ok(r) if r.kind() == Some(ReferenceType::Symbolic) => {
            Ok(r.symbolic_target().map(str::to_string))
        }
        Ok(_) => Ok(None),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn resolve_ref(repo: &Repository, name: &str) -> Result<Option<ObjectId>> {
    let reference = match repo.find_reference(&full_name(name)) {
        Ok(r) => r,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match reference.resolve() {
        Ok(resolved) => Ok(resolved.target().map(ObjectId::from)),
        Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::UnbornBranch) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes through symbolic refs, so advancing `EXEC_BRANCH` advances the
/// branch itself and advancing `HEAD` advances the checked-out branch.
fn set_ref_in(repo: &Repository, name: &str, id: ObjectId) -> Result<()> {
    let mut target = full_name(name);
    for _ in 0..MAX_SYMBOLIC_DEPTH {
        match symbolic_target(repo, &target)? {
            Some(next) => target = next,
            None => break,
        }
    }
    if target == HEAD {
        repo.set_head_detached(id.oid())?;
    } else {
        repo.reference(&target, id.oid(), true, "exp: set ref")?;
    }
    Ok(())
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn resolve_commit<'r>(repo: &'r Repository, rev: &str) -> Result<Commit<'r>> {
    let rev = rev.trim();
    let object = repo.revparse_single(rev).map_err(|e| match e.code() {
        ErrorCode::Ambiguous => ExpError::AmbiguousRev(rev.to_string()),
        _ => {
            debug!(rev, error = %e.message(), "Revision did not resolve");
            ExpError::RevNotFound(rev.to_string())
        }
    })?;
    object
        .peel_to_commit()
        .map_err(|_| ExpError::RevNotFound(rev.to_string()))
}

fn sync_index_to_head(repo: &Repository) -> Result<()> {
    if let Some(head) = head_commit(repo)? {
        let mut index = repo.index()?;
        index.read_tree(&head.tree()?)?;
        index.write()?;
    }
    Ok(())
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
    }
}

fn status_options(untracked: bool) -> StatusOptions {
    let mut opts = StatusOptions::new();
    opts.include_untracked(untracked)
        .recurse_untracked_dirs(untracked)
        .include_ignored(false)
        .exclude_submodules(true);
    opts
}

fn empty_tree(repo: &Repository) -> Result<Tree<'_>> {
    let oid = repo.treebuilder(None)?.write()?;
    Ok(repo.find_tree(oid)?)
}

fn stash_ids(repo: &mut Repository) -> Result<Vec<ObjectId>> {
    let mut ids = Vec::new();
    repo.stash_foreach(|_, _, oid| {
        ids.push(ObjectId::from(*oid));
        true
    })?;
    Ok(ids)
}

/// Replays a stash commit: its first parent is the base, its tree plus any
/// untracked-files parent is the result.
fn apply_stash(scm: &GitScm, repo: &Repository, rev: ObjectId, skip_conflicts: bool) -> Result<()> {
    let stash = repo.find_commit(rev.oid())?;
    let base = match stash.parent_count() {
        0 => empty_tree(repo)?,
        _ => stash.parent(0)?.tree()?,
    };

    let theirs = if stash.parent_count() >= 3 {
        let mut index = Index::new()?;
        index.read_tree(&stash.tree()?)?;
        add_tree_entries(&mut index, &stash.parent(2)?.tree()?)?;
        repo.find_tree(index.write_tree_to(repo)?)?
    } else {
        stash.tree()?
    };

    scm.merge_into_worktree(repo, &base, &theirs, skip_conflicts)?;
    debug!(stash = %rev.short(), "Applied stash");
    Ok(())
}

fn add_tree_entries(index: &mut Index, tree: &Tree<'_>) -> Result<()> {
    let mut entries = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                entries.push((format!("{}{}", dir, name), entry.id(), entry.filemode() as u32));
            }
        }
        TreeWalkResult::Ok
    })?;
    for (path, id, mode) in entries {
        index.add(&index_entry(&path, id, mode, 0))?;
    }
    Ok(())
}

fn index_entry(path: &str, id: Oid, mode: u32, size: u64) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: size as u32,
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// Tree of the working tree as it is now: HEAD's tree with every changed,
/// deleted and (optionally) untracked file applied.
fn worktree_tree(repo: &Repository, root: &Path, include_untracked: bool) -> Result<Oid> {
    let mut index = Index::new()?;
    if let Some(head) = head_commit(repo)? {
        index.read_tree(&head.tree()?)?;
    }

    let statuses = repo.statuses(Some(&mut status_options(include_untracked)))?;
    for entry in statuses.iter() {
        if entry.status().is_ignored() {
            continue;
        }
        let Some(path) = entry.path() else {
            continue;
        };
        let rel = Path::new(path);
        match fs::symlink_metadata(root.join(rel)) {
            Ok(meta) if meta.is_file() => {
                let id = repo.blob_path(&root.join(rel))?;
                index.add(&index_entry(path, id, file_mode(&meta), meta.len()))?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match index.remove(rel, 0) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok(index.write_tree_to(repo)?)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        FileMode::BlobExecutable.into()
    } else {
        FileMode::Blob.into()
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    FileMode::Blob.into()
}

fn collect_conflicts(index: &Index) -> Result<Vec<(String, Option<IndexEntry>)>> {
    let mut conflicts = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let path = [&conflict.our, &conflict.their, &conflict.ancestor]
            .into_iter()
            .flatten()
            .next()
            .map(|e| String::from_utf8_lossy(&e.path).into_owned());
        if let Some(path) = path {
            conflicts.push((path, conflict.our));
        }
    }
    Ok(conflicts)
}

/// Rewrites the files that differ between `from` and `to`. Returns the
/// number of paths touched.
fn write_worktree(repo: &Repository, root: &Path, from: &Tree<'_>, to: &Tree<'_>) -> Result<usize> {
    let diff = repo.diff_tree_to_tree(Some(from), Some(to), None)?;
    let mut touched = 0;
    for delta in diff.deltas() {
        match delta.status() {
            Delta::Deleted => {
                if let Some(path) = delta.old_file().path() {
                    remove_worktree_file(root, path)?;
                    touched += 1;
                }
            }
            Delta::Added | Delta::Modified | Delta::Typechange => {
                let file = delta.new_file();
                if file.mode() == FileMode::Commit {
                    continue;
                }
                if let Some(path) = file.path() {
                    let blob = repo.find_blob(file.id())?;
                    write_worktree_file(
                        &root.join(path),
                        blob.content(),
                        file.mode() == FileMode::BlobExecutable,
                    )?;
                    touched += 1;
                }
            }
            _ => {}
        }
    }
    Ok(touched)
}

fn write_worktree_file(path: &Path, content: &[u8], executable: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = executable;
    Ok(())
}

fn remove_worktree_file(root: &Path, rel: &Path) -> Result<()> {
    let path = root.join(rel);
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
    Ok(())
}

fn exclude_exp_dir(repo: &Repository) -> Result<()> {
    let line = format!("/{}/", EXP_DIR);
    let path = repo.path().join("info").join("exclude");
    let existing = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing.lines().any(|l| l.trim() == line) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{}", line)?;
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
