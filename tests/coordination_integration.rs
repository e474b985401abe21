use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use swarmdb::store::CoordinationDb;
use swarmdb::store::locks::LockOutcome;
use swarmdb::store::reservations::{ReserveOptions, ReserveOutcome};
use swarmdb::worktree;
use tempfile::tempdir;

fn db_path(root: &Path) -> PathBuf {
    root.join(".opencode").join("swarm.db")
}

#[test]
fn worktree_and_principal_resolve_to_same_database() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("repo");
    fs::create_dir_all(root.join(".git/worktrees/wt-a")).unwrap();
    fs::create_dir_all(root.join("crates/core/src")).unwrap();

    let wt = dir.path().join("wt-a");
    fs::create_dir_all(wt.join("src")).unwrap();
    fs::write(wt.join(".git"), "gitdir: ../repo/.git/worktrees/wt-a\n").unwrap();

    let from_root = worktree::resolve_db_path(&root, "swarm.db").unwrap();
    let from_sub = worktree::resolve_db_path(&root.join("crates/core/src"), "swarm.db").unwrap();
    let from_wt = worktree::resolve_db_path(&wt.join("src"), "swarm.db").unwrap();

    assert_eq!(from_root, db_path(&root));
    assert_eq!(from_sub, from_root);
    assert_eq!(from_wt, from_root);

    // Writes from the worktree are visible from the principal checkout.
    let wt_db = CoordinationDb::from_project(&wt).unwrap();
    wt_db
        .register_agent("proj", "wt-agent", "opencode", "m", None)
        .unwrap();
    wt_db.close().unwrap();

    let root_db = CoordinationDb::from_project(&root).unwrap();
    assert_eq!(root_db.list_agents("proj").unwrap().len(), 1);
}

#[test]
fn racing_exclusive_reservations_allow_one_winner() {
    let dir = tempdir().unwrap();
    let path = Arc::new(db_path(dir.path()));
    CoordinationDb::open(&path).unwrap().close().unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let make_runner = |agent: &'static str| {
        let path = Arc::clone(&path);
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            let db = CoordinationDb::open(&path).unwrap();
            barrier.wait();
            db.reserve("proj", agent, "src/store/mod.rs", &ReserveOptions::default())
                .unwrap()
        })
    };

    let t1 = make_runner("agent-a");
    let t2 = make_runner("agent-b");
    barrier.wait();
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let granted = usize::from(r1.is_granted()) + usize::from(r2.is_granted());
    assert_eq!(granted, 1, "expected exactly one reservation: {r1:?} / {r2:?}");

    let db = CoordinationDb::open(&path).unwrap();
    let active = db.active_reservations("proj").unwrap();
    assert_eq!(active.len(), 1);

    let loser = match (r1, r2) {
        (ReserveOutcome::Conflict(c), _) | (_, ReserveOutcome::Conflict(c)) => c,
        other => panic!("expected one conflict: {other:?}"),
    };
    assert_eq!(loser.holder, active[0].agent_name);
}

#[test]
fn racing_lock_acquisitions_allow_one_holder() {
    let dir = tempdir().unwrap();
    let path = Arc::new(db_path(dir.path()));
    CoordinationDb::open(&path).unwrap().close().unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|holder| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let db = CoordinationDb::open(&path).unwrap();
                barrier.wait();
                db.acquire_lock("proj", "deploy", holder, Duration::from_secs(60))
                    .unwrap()
            })
        })
        .collect();
    barrier.wait();

    let outcomes: Vec<LockOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let acquired: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            LockOutcome::Acquired(lock) => Some(lock.clone()),
            LockOutcome::Contended(_) => None,
        })
        .collect();
    assert_eq!(acquired.len(), 1, "{outcomes:?}");
    assert_eq!(acquired[0].seq, 1);

    let db = CoordinationDb::open(&path).unwrap();
    assert_eq!(db.current_lock("deploy").unwrap(), Some(acquired[0].clone()));
}

#[test]
fn rebuilt_projections_match_live_state() {
    let dir = tempdir().unwrap();
    let db = CoordinationDb::open(&db_path(dir.path())).unwrap();

    db.register_agent("proj", "a", "opencode", "m", Some("docs"))
        .unwrap();
    db.register_agent("proj", "b", "opencode", "m", None)
        .unwrap();
    let res = match db
        .reserve("proj", "a", "docs/**", &ReserveOptions::default())
        .unwrap()
    {
        ReserveOutcome::Granted(r) => r,
        other => panic!("{other:?}"),
    };
    db.reserve("proj", "b", "src", &ReserveOptions::default())
        .unwrap();
    db.release(&res.id).unwrap();
    db.acquire_lock("proj", "deploy", "b", Duration::from_secs(60))
        .unwrap();

    let agents = db.list_agents("proj").unwrap();
    let active = db.active_reservations("proj").unwrap();
    let locks = db.list_locks().unwrap();

    db.rebuild_projections().unwrap();

    assert_eq!(db.list_agents("proj").unwrap(), agents);
    assert_eq!(db.active_reservations("proj").unwrap(), active);
    assert_eq!(db.list_locks().unwrap(), locks);
    assert!(db.get_reservation(&res.id).unwrap().unwrap().released_at.is_some());
}
