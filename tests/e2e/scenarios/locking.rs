use crate::harness::TestWorkspace;
use exp_core::{
    Executor, ExpError, IsolatedExecutor, RefLocks, RepoLock, RetryPolicy, Scm, TaskStatus,
    EXEC_HEAD, EXEC_NAMESPACE, EXPS_TEMP,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn repo_with_commit() -> (TestWorkspace, exp_core::ExpRepo) {
    let ws = TestWorkspace::empty().unwrap();
    let repo = ws.init_exp().unwrap();
    ws.write_file("params.yaml", b"lr: 0.1\n").unwrap();
    repo.scm().commit("initial").unwrap();
    (ws, repo)
}

#[test]
fn test_writer_never_releasing_times_out() {
    let (_ws, repo) = repo_with_commit();
    let locks = repo.ref_locks();
    let held = locks
        .acquire(Vec::<String>::new(), [EXEC_HEAD], &RetryPolicy::no_retry())
        .unwrap();

    let policy = RetryPolicy::new(5, Duration::from_millis(20));
    let started = Instant::now();
    let err = locks
        .acquire(Vec::<String>::new(), [EXEC_HEAD], &policy)
        .unwrap_err();

    match err {
        ExpError::LockContention { names, attempts } => {
            assert_eq!(attempts, 5);
            assert!(names.iter().any(|n| n == EXEC_HEAD));
        }
        other => panic!("expected LockContention, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(80));
    held.release().unwrap();

    // Released: the same request now succeeds first time.
    locks
        .acquire(Vec::<String>::new(), [EXEC_HEAD], &RetryPolicy::no_retry())
        .unwrap()
        .release()
        .unwrap();
}

#[test]
fn test_namespace_lease_blocks_refs_beneath_it() {
    let (_ws, repo) = repo_with_commit();
    let locks = repo.ref_locks();
    let _namespace = locks
        .acquire(Vec::<String>::new(), [EXEC_NAMESPACE], &RetryPolicy::no_retry())
        .unwrap();

    let err = locks
        .acquire([EXEC_HEAD], Vec::<String>::new(), &RetryPolicy::no_retry())
        .unwrap_err();
    assert!(err.is_lock_contention());

    // Disjoint names proceed.
    locks
        .acquire(Vec::<String>::new(), ["heads/main"], &RetryPolicy::no_retry())
        .unwrap();
}

#[test]
fn test_readers_share_a_ref() {
    let (_ws, repo) = repo_with_commit();
    let locks = repo.ref_locks();
    let first = locks
        .acquire(["heads/main"], Vec::<String>::new(), &RetryPolicy::no_retry())
        .unwrap();
    let second = locks
        .acquire(["heads/main"], Vec::<String>::new(), &RetryPolicy::no_retry())
        .unwrap();
    assert!(locks
        .acquire(Vec::<String>::new(), ["heads/main"], &RetryPolicy::no_retry())
        .is_err());
    first.release().unwrap();
    second.release().unwrap();
}

#[test]
fn test_apply_waits_for_repository_lock() {
    let (ws, repo) = repo_with_commit();
    ws.write_file("params.yaml", b"lr: 0.2\n").unwrap();
    repo.queue().enqueue(Some("exp-1"), vec![], None).unwrap();
    repo.scm().reset(true).unwrap();

    let held = RepoLock::acquire(repo.exp_dir()).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        drop(held);
    });

    let started = Instant::now();
    repo.apply("exp-1", true).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    releaser.join().unwrap();
    assert_eq!(ws.read_file("params.yaml").unwrap(), b"lr: 0.2\n");
}

#[test]
fn test_apply_gives_up_on_held_repository_lock() {
    let (ws, _) = repo_with_commit();
    ws.write_file(".exp/config.toml", b"[lock]\nmax_attempts = 3\nbackoff_ms = 10\n")
        .unwrap();
    let repo = ws.open_exp().unwrap();
    ws.write_file("params.yaml", b"lr: 0.2\n").unwrap();
    repo.queue().enqueue(Some("exp-1"), vec![], None).unwrap();

    let _held = RepoLock::acquire(repo.exp_dir()).unwrap();
    let err = repo.apply("exp-1", true).unwrap_err();
    assert!(matches!(err, ExpError::RepositoryLockHeld { .. }));
    assert_eq!(ws.read_file("params.yaml").unwrap(), b"lr: 0.2\n");
}

#[test]
fn test_concurrent_initialize_consumes_entry_once() {
    let (ws, repo) = repo_with_commit();
    ws.write_file("params.yaml", b"lr: 0.9\n").unwrap();
    let entry = repo.queue().enqueue(Some("shared"), vec![], None).unwrap();

    let base: Arc<dyn Scm> = Arc::clone(repo.scm());
    let parent = repo.executor_dir();
    let cache = repo.cache_dir();
    let locks: RefLocks = repo.ref_locks();
    let infofile_dir = repo.tmp_dir().join("exps").join("run");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let base = Arc::clone(&base);
            let parent = parent.clone();
            let cache = cache.clone();
            let locks = locks.clone();
            let entry = entry.clone();
            let infofile = infofile_dir.join(format!("attempt-{i}.json"));
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let policy = RetryPolicy::new(200, Duration::from_millis(5));
                let mut exec = IsolatedExecutor::new("shared", &parent, &cache, locks, policy)
                    .unwrap();
                barrier.wait();
                let result = exec.initialize(base.as_ref(), &entry, &infofile, None);
                let status = exec.info().status;
                let root = exec.root_dir().to_path_buf();
                let merged = std::fs::read(root.join("params.yaml")).ok();
                exec.cleanup(&infofile).unwrap();
                (result, status, merged)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter(|(r, _, _)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one executor receives the entry");
    assert_eq!(winners[0].1, TaskStatus::Preparing);
    assert_eq!(winners[0].2.as_deref(), Some(&b"lr: 0.9\n"[..]));

    let loser = results.iter().find(|(r, _, _)| r.is_err()).unwrap();
    assert!(matches!(loser.0, Err(ExpError::StashConsumed(_))));
    assert_eq!(loser.1, TaskStatus::Failed);

    assert!(repo.scm().list_refs(EXPS_TEMP).unwrap().is_empty());
}
