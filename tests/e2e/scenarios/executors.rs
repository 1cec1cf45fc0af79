use crate::harness::{Assertion, Scenario, TestWorkspace};
use exp_core::{
    ExecutorKind, ExpError, ExpRepo, RefValue, TaskStatus, EXEC_APPLY, EXEC_BASELINE,
    EXEC_BRANCH, EXEC_CHECKPOINT, EXEC_HEAD, EXEC_MERGE,
};

#[test]
fn test_isolated_run_records_experiment_on_branch() {
    Scenario::new("isolated_branch")
        .with_file("params.yaml", b"lr: 0.1\n")
        .user_commits("initial")
        .user_writes("params.yaml", b"lr: 0.4\n")
        .queues_with("exp-1", &[], Some("results"))
        .user_resets()
        .runs_isolated("exp-1")
        .assert(Assertion::ExperimentCount(1))
        .assert(Assertion::QueueLength(0))
        .assert(Assertion::NoTempRefs)
        .assert(Assertion::RefIsExperiment {
            ref_name: "heads/results".into(),
            name: "exp-1".into(),
        })
        .assert_file("params.yaml", "lr: 0.1\n")
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            let roots = std::fs::read_dir(repo.executor_dir())?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("exec-"))
                .count();
            anyhow::ensure!(roots == 0, "{} executor roots left behind", roots);
            anyhow::ensure!(!repo.infofile_path("exp-1").exists());
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_isolated_run_executes_command() {
    Scenario::new("isolated_command")
        .with_file("params.yaml", b"lr: 0.1\n")
        .user_commits("initial")
        .user_writes("params.yaml", b"lr: 0.2\n")
        .queues_with(
            "exp-cmd",
            &["sh", "-c", "cat params.yaml > metrics.txt"],
            None,
        )
        .user_resets()
        .runs_isolated("exp-cmd")
        .applies("exp-cmd", true)
        .assert_file("metrics.txt", "lr: 0.2\n")
        .assert_file("params.yaml", "lr: 0.2\n")
        .run()
        .unwrap();
}

#[test]
fn test_in_place_run_restores_head_and_refs() {
    Scenario::new("in_place")
        .with_file("params.yaml", b"lr: 0.1\n")
        .user_commits("initial")
        .user_writes("params.yaml", b"lr: 0.6\n")
        .queues_with("ws-1", &[], Some("tuned"))
        .runs_in_place("ws-1")
        .assert(Assertion::ExperimentCount(1))
        .assert(Assertion::RefMissing(EXEC_BASELINE.into()))
        .assert(Assertion::RefMissing(EXEC_MERGE.into()))
        .assert(Assertion::RefMissing(EXEC_BRANCH.into()))
        .assert(Assertion::RefMissing(EXEC_APPLY.into()))
        .assert(Assertion::NoTempRefs)
        .assert(Assertion::RefIsExperiment {
            ref_name: "heads/tuned".into(),
            name: "ws-1".into(),
        })
        .assert(Assertion::Custom(Box::new(|repo: &ExpRepo| -> anyhow::Result<()> {
            anyhow::ensure!(repo.scm().head_ref()? == RefValue::Symbolic("heads/main".into()));
            Ok(())
        })))
        .run()
        .unwrap();
}

#[test]
fn test_in_place_checkpoint_is_published() {
    let ws = TestWorkspace::empty().unwrap();
    let repo = ws.init_exp().unwrap();
    ws.write_file("params.yaml", b"lr: 0.1\n").unwrap();
    repo.scm().commit("initial").unwrap();
    ws.write_file("params.yaml", b"lr: 0.3\n").unwrap();

    // The workload records a checkpoint by pointing EXEC_CHECKPOINT at HEAD.
    let script = format!(
        "printf '%s\\n' \"$(cat .git/refs/{})\" > .git/refs/{}",
        EXEC_HEAD, EXEC_CHECKPOINT
    );
    repo.queue()
        .enqueue(Some("ckpt"), vec!["sh".into(), "-c".into(), script], None)
        .unwrap();

    let outcome = repo.run_queued("ckpt", ExecutorKind::InPlace).unwrap();
    assert_eq!(outcome.info.status, TaskStatus::Success);
    let checkpoint = repo.scm().get_ref(EXEC_CHECKPOINT).unwrap();
    assert!(checkpoint.is_some());
    assert_eq!(repo.scm().get_ref(EXEC_APPLY).unwrap(), checkpoint);
}

#[test]
fn test_failed_command_records_nothing() {
    let ws = TestWorkspace::empty().unwrap();
    let repo = ws.init_exp().unwrap();
    ws.write_file("params.yaml", b"lr: 0.1\n").unwrap();
    repo.scm().commit("initial").unwrap();
    repo.queue()
        .enqueue(Some("broken"), vec!["sh".into(), "-c".into(), "exit 7".into()], None)
        .unwrap();

    let outcome = repo.run_queued("broken", ExecutorKind::Isolated).unwrap();
    assert_eq!(outcome.info.status, TaskStatus::Failed);
    assert_eq!(outcome.info.exit_code, Some(7));
    assert!(outcome.exp_ref.is_none());
    assert!(repo.list_experiments(None).unwrap().is_empty());

    let err = repo.apply("broken", true).unwrap_err();
    assert!(matches!(err, ExpError::InvalidExperimentReference(_)));
}

#[test]
fn test_second_run_of_same_entry_fails() {
    let ws = TestWorkspace::empty().unwrap();
    let repo = ws.init_exp().unwrap();
    ws.write_file("params.yaml", b"lr: 0.1\n").unwrap();
    repo.scm().commit("initial").unwrap();
    repo.queue().enqueue(Some("once"), vec![], None).unwrap();

    repo.run_queued("once", ExecutorKind::Isolated).unwrap();
    let err = repo.run_queued("once", ExecutorKind::Isolated).unwrap_err();
    assert!(matches!(err, ExpError::StashConsumed(_)));
}
