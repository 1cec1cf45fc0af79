use crate::harness::{Assertion, ErrorKind, Fault, Scenario};
use exp_core::{ExpError, ExpRepo, EXEC_APPLY, PACKED_ARGS_FILE};

/// Baseline with a single committed `a.txt` and a finished `exp-1` that
/// rewrites it.
fn with_finished_experiment(name: &str) -> Scenario {
    Scenario::new(name)
        .with_file("a.txt", b"base\n")
        .with_file("b.txt", b"other\n")
        .user_commits("initial")
        .user_writes("a.txt", b"exp\n")
        .finished_experiment("exp-1")
}

#[test]
fn test_apply_on_clean_workspace() {
    with_finished_experiment("apply_clean")
        .assert(Assertion::WorkspaceClean)
        .applies("exp-1", true)
        .assert_file("a.txt", "exp\n")
        .assert_file("b.txt", "other\n")
        .assert(Assertion::RefIsExperiment {
            ref_name: EXEC_APPLY.into(),
            name: "exp-1".into(),
        })
        .assert(Assertion::NoStashEntries)
        .assert(Assertion::WorkspaceDirty)
        .run()
        .unwrap();
}

#[test]
fn test_forced_apply_keeps_experiment_version() {
    with_finished_experiment("apply_forced")
        .user_writes("a.txt", b"mine\n")
        .applies("exp-1", true)
        .assert_file("a.txt", "exp\n")
        .assert(Assertion::NoStashEntries)
        .run()
        .unwrap();
}

#[test]
fn test_unforced_conflict_restores_user_changes() {
    with_finished_experiment("apply_no_force")
        .user_writes("a.txt", b"mine\n")
        .user_writes("notes.txt", b"untracked\n")
        .snapshot("before")
        .apply_fails("exp-1", false, ErrorKind::ApplyConflict)
        .assert_file("a.txt", "mine\n")
        .assert_restored("before")
        .assert(Assertion::NoStashEntries)
        .assert(Assertion::RefMissing(EXEC_APPLY.into()))
        .run()
        .unwrap();
}

#[test]
fn test_unknown_name_changes_nothing() {
    with_finished_experiment("apply_unknown")
        .user_writes("b.txt", b"dirty\n")
        .snapshot("before")
        .apply_fails("not-a-real-name", true, ErrorKind::InvalidExperimentReference)
        .assert_restored("before")
        .assert(Assertion::RefMissing(EXEC_APPLY.into()))
        .assert(Assertion::ExperimentCount(1))
        .assert(Assertion::NoStashEntries)
        .run()
        .unwrap();
}

#[test]
fn test_merge_failure_rolls_back_dirty_workspace() {
    with_finished_experiment("rollback_merge")
        .user_writes("b.txt", b"dirty\n")
        .user_writes("scratch.txt", b"untracked\n")
        .snapshot("before")
        .inject(Fault::Merge)
        .apply_fails("exp-1", true, ErrorKind::MergeFailure)
        .assert_restored("before")
        .assert(Assertion::NoStashEntries)
        .run()
        .unwrap();
}

#[test]
fn test_merge_failure_on_clean_workspace() {
    with_finished_experiment("rollback_merge_clean")
        .snapshot("before")
        .inject(Fault::Merge)
        .apply_fails("exp-1", true, ErrorKind::MergeFailure)
        .assert_restored("before")
        .assert(Assertion::WorkspaceClean)
        .run()
        .unwrap();
}

#[test]
fn test_reapply_failure_rolls_back() {
    with_finished_experiment("rollback_reapply")
        .user_writes("b.txt", b"dirty\n")
        .snapshot("before")
        .inject(Fault::StashApply)
        .apply_fails("exp-1", true, ErrorKind::Io)
        .assert_restored("before")
        .assert(Assertion::NoStashEntries)
        .clear_faults()
        .applies("exp-1", true)
        .assert_file("a.txt", "exp\n")
        .assert_file("b.txt", "dirty\n")
        .run()
        .unwrap();
}

#[test]
fn test_late_failure_rolls_back_merged_changes() {
    // Nothing stashed, so the failing soft reset is the one after the merge.
    with_finished_experiment("rollback_late")
        .snapshot("before")
        .inject(Fault::SoftReset)
        .apply_fails("exp-1", true, ErrorKind::Io)
        .assert_restored("before")
        .assert_file("a.txt", "base\n")
        .assert(Assertion::RefMissing(EXEC_APPLY.into()))
        .run()
        .unwrap();
}

#[test]
fn test_rollback_discards_files_added_by_experiment() {
    Scenario::new("rollback_new_file")
        .with_file("a.txt", b"base\n")
        .user_commits("initial")
        .user_writes("a.txt", b"exp\n")
        .user_writes("model.bin", b"weights")
        .queues("exp-1")
        .user_resets()
        .user_removes("model.bin")
        .runs_isolated("exp-1")
        .user_writes("a.txt", b"mine\n")
        .snapshot("before")
        .apply_fails("exp-1", false, ErrorKind::ApplyConflict)
        .assert(Assertion::FileMissing {
            path: "model.bin".into(),
        })
        .assert_restored("before")
        .run()
        .unwrap();
}

#[test]
fn test_baseline_mismatch_is_rejected() {
    with_finished_experiment("baseline_gating")
        .user_writes("b.txt", b"moved on\n")
        .user_commits("second")
        .snapshot("before")
        .apply_fails("exp-1", true, ErrorKind::InvalidExperimentReference)
        .assert_restored("before")
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            // Also rejected when addressed by commit id.
            let (_, commit) = repo.list_experiments(None)?.remove(0);
            match repo.apply(&commit.as_hex(), true) {
                Err(ExpError::InvalidExperimentReference(_)) => Ok(()),
                other => anyhow::bail!("expected InvalidExperimentReference, got {:?}", other),
            }
        })))
        .assert(Assertion::RefMissing(EXEC_APPLY.into()))
        .run()
        .unwrap();
}

#[test]
fn test_apply_queued_entry_removes_packed_args() {
    Scenario::new("apply_queued")
        .with_file("params.yaml", b"lr: 0.1\n")
        .user_commits("initial")
        .user_writes("params.yaml", b"lr: 0.5\n")
        .queues_with("queued-1", &["python", "train.py"], None)
        .user_resets()
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            anyhow::ensure!(repo.tmp_dir().join(PACKED_ARGS_FILE).exists());
            Ok(())
        })))
        .applies("queued-1", true)
        .assert_file("params.yaml", "lr: 0.5\n")
        .assert(Assertion::QueueLength(1))
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            anyhow::ensure!(!repo.tmp_dir().join(PACKED_ARGS_FILE).exists());
            let entry = repo.queue().get("queued-1")?.expect("entry still queued");
            anyhow::ensure!(repo.scm().get_ref(EXEC_APPLY)? == Some(entry.stash_rev));
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_apply_by_experiment_ref_name() {
    with_finished_experiment("apply_by_ref")
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            let (info, commit) = repo.list_experiments(None)?.remove(0);
            let report = repo.apply(&info.ref_name(), true)?;
            anyhow::ensure!(report.commit == commit);
            Ok(())
        })))
        .assert_file("a.txt", "exp\n")
        .run()
        .unwrap();
}
