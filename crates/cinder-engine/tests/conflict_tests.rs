//! Commit conflicts and the retrospective lock list.

mod common;

use cinder_engine::{Engine, ErrorCode, IsolationLevel};

#[test]
fn loser_aborts_with_race_then_commits_with_rll() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let counter = engine.registry().create_array("counter", 8, 1).unwrap();

    let mut t1 = engine.attach_thread();
    let mut t2 = engine.attach_thread();

    // Both transactions read-modify-write the same record before either
    // commits.
    t1.begin(IsolationLevel::Serializable).unwrap();
    let v1 = counter.get_primitive::<i64>(t1.xct(), 0, 0).unwrap();
    counter
        .overwrite_primitive::<i64>(t1.xct(), 0, v1 + 10, 0)
        .unwrap();

    t2.begin(IsolationLevel::Serializable).unwrap();
    let v2 = counter.get_primitive::<i64>(t2.xct(), 0, 0).unwrap();
    counter
        .overwrite_primitive::<i64>(t2.xct(), 0, v2 + 100, 0)
        .unwrap();

    // First committer wins.
    t1.precommit().unwrap();

    // The second observes the stale read and aborts with a race; the
    // abort leaves lock advice behind for the retry.
    let err = t2.precommit().unwrap_err();
    assert_eq!(err.code, ErrorCode::RaceAbort);
    assert!(!t2.xct().is_active());
    assert!(!t2.xct().retrospective_lock_list().is_empty());

    // Retry: the RLL pre-locks the record, the fresh read sees the
    // winner's value, and the commit goes through.
    t2.begin(IsolationLevel::Serializable).unwrap();
    assert!(!t2.xct().current_lock_list().is_empty());
    let v2 = counter.get_primitive::<i64>(t2.xct(), 0, 0).unwrap();
    assert_eq!(v2, 10);
    counter
        .overwrite_primitive::<i64>(t2.xct(), 0, v2 + 100, 0)
        .unwrap();
    let commit_epoch = t2.precommit().unwrap();
    engine.wait_for_commit(commit_epoch).unwrap();

    // Final value is the second transaction's write, applied on top of
    // the first's.
    let mut probe = engine.attach_thread();
    probe.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(
        counter.get_primitive::<i64>(probe.xct(), 0, 0).unwrap(),
        110
    );
    probe.abort().unwrap();
    engine.shutdown();
}

#[test]
fn successful_commit_clears_the_rll() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let counter = engine.registry().create_array("counter", 8, 1).unwrap();

    let mut t1 = engine.attach_thread();
    let mut t2 = engine.attach_thread();

    // Manufacture one race abort for t2.
    t1.begin(IsolationLevel::Serializable).unwrap();
    t2.begin(IsolationLevel::Serializable).unwrap();
    let _ = counter.get_primitive::<i64>(t2.xct(), 0, 0).unwrap();
    counter.overwrite_primitive::<i64>(t2.xct(), 0, 1, 0).unwrap();
    counter.overwrite_primitive::<i64>(t1.xct(), 0, 2, 0).unwrap();
    t1.precommit().unwrap();
    assert_eq!(t2.precommit().unwrap_err().code, ErrorCode::RaceAbort);
    assert!(!t2.xct().retrospective_lock_list().is_empty());

    // The successful retry consumes the advice.
    t2.begin(IsolationLevel::Serializable).unwrap();
    counter.overwrite_primitive::<i64>(t2.xct(), 0, 3, 0).unwrap();
    t2.precommit().unwrap();
    assert!(t2.xct().retrospective_lock_list().is_empty());
    engine.shutdown();
}

#[test]
fn write_write_without_reads_does_not_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let counter = engine.registry().create_array("counter", 8, 2).unwrap();

    let mut t1 = engine.attach_thread();
    let mut t2 = engine.attach_thread();

    // Blind writes to the same record: both commit (last writer's value
    // survives in serial order).
    t1.begin(IsolationLevel::Serializable).unwrap();
    counter.overwrite_primitive::<i64>(t1.xct(), 0, 7, 0).unwrap();
    t2.begin(IsolationLevel::Serializable).unwrap();
    counter.overwrite_primitive::<i64>(t2.xct(), 0, 9, 0).unwrap();
    t1.precommit().unwrap();
    t2.precommit().unwrap();

    let mut probe = engine.attach_thread();
    probe.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(counter.get_primitive::<i64>(probe.xct(), 0, 0).unwrap(), 9);
    probe.abort().unwrap();
    engine.shutdown();
}
