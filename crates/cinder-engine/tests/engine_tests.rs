//! Engine lifecycle and basic transactional round trips.

mod common;

use cinder_engine::{Engine, ErrorCode, IsolationLevel};

#[test]
fn overwrite_then_get_round_trips_across_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let kv = engine.registry().create_array("kv", 32, 16).unwrap();

    let mut ctx = engine.attach_thread();
    let payload = *b"the quick brown fox jumps over l";
    let epoch = ctx
        .retry_transaction(|xct| {
            kv.overwrite(xct, 5, &payload)?;
            Ok(())
        })
        .unwrap();
    engine.wait_for_commit(epoch).unwrap();

    ctx.begin(IsolationLevel::Serializable).unwrap();
    let mut out = [0u8; 32];
    kv.get(ctx.xct(), 5, &mut out).unwrap();
    assert_eq!(out, payload);
    // Partial read through get_part.
    let mut part = [0u8; 9];
    kv.get_part(ctx.xct(), 5, &mut part, 4).unwrap();
    assert_eq!(&part, b"quick bro");
    ctx.abort().unwrap();
    engine.shutdown();
}

#[test]
fn uncommitted_writes_are_invisible_and_abort_discards_them() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let kv = engine.registry().create_array("kv", 16, 4).unwrap();

    let mut writer = engine.attach_thread();
    let mut reader = engine.attach_thread();

    writer.begin(IsolationLevel::Serializable).unwrap();
    kv.overwrite_primitive::<i64>(writer.xct(), 0, 99, 0).unwrap();

    reader.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(kv.get_primitive::<i64>(reader.xct(), 0, 0).unwrap(), 0);
    reader.abort().unwrap();

    writer.abort().unwrap();
    reader.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(kv.get_primitive::<i64>(reader.xct(), 0, 0).unwrap(), 0);
    reader.abort().unwrap();
    engine.shutdown();
}

#[test]
fn structural_errors_surface_without_aborting_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let kv = engine.registry().create_array("kv", 16, 4).unwrap();

    let mut ctx = engine.attach_thread();
    ctx.begin(IsolationLevel::Serializable).unwrap();
    let mut out = [0u8; 16];
    assert_eq!(
        kv.get(ctx.xct(), 4, &mut out).unwrap_err(),
        ErrorCode::InvalidRecord
    );
    // The transaction is still usable after a structural error.
    kv.get(ctx.xct(), 3, &mut out).unwrap();
    ctx.precommit().unwrap();

    assert_eq!(
        engine
            .registry()
            .create_array("kv", 16, 4)
            .unwrap_err()
            .code,
        ErrorCode::DuplicateStorageName
    );
    engine.shutdown();
}

#[test]
fn concurrent_increments_never_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    let counter = engine.registry().create_array("counter", 16, 1).unwrap();

    const THREADS: usize = 4;
    const PER_THREAD: i64 = 50;
    let mut contexts: Vec<_> = (0..THREADS).map(|_| engine.attach_thread()).collect();
    std::thread::scope(|scope| {
        for mut ctx in contexts.drain(..) {
            let counter = &counter;
            scope.spawn(move || {
                for _ in 0..PER_THREAD {
                    ctx.retry_transaction(|xct| {
                        counter.increment::<i64>(xct, 0, 1, 0)?;
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });

    let mut probe = engine.attach_thread();
    probe.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(
        counter.get_primitive::<i64>(probe.xct(), 0, 0).unwrap(),
        THREADS as i64 * PER_THREAD
    );
    probe.abort().unwrap();
    engine.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_drop_tolerates_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(common::engine_options(dir.path())).unwrap();
    engine.shutdown();
    engine.shutdown();
    drop(engine); // Drop runs shutdown a third time.
}

#[test]
fn restart_without_a_snapshot_is_a_fresh_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::restart(common::engine_options(dir.path())).unwrap();
    assert!(engine.registry().array("anything").is_err());
    engine.shutdown();
}
