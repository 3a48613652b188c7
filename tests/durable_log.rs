mod test_utils;

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use redis_engine::aof::{replay_file, DurableLog, LogApplier, RewriteState};
use redis_engine::engine::LoadSource;
use redis_engine::keyspace::Keyspace;
use redis_engine::time::ManualClock;
use test_utils::{sorted, string_value, TestEnv};

fn replay_into_fresh_keyspace(path: &std::path::Path) -> Keyspace {
    let keyspace = Keyspace::new(16, Arc::new(ManualClock::new(1_000_000)));
    let mut applier = LogApplier::new(&keyspace);
    replay_file(path, |command| applier.apply(&command).unwrap()).unwrap();
    drop(applier);
    keyspace
}

#[test]
fn test_truncated_trailing_record_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appendonly.aof");
    {
        let log = DurableLog::open(&path).unwrap();
        log.log(0, &["SET", "a", "1"]).unwrap();
        log.log(0, &["SET", "b", "2"]).unwrap();
        log.log(0, &["SET", "c", "3"]).unwrap();
    }

    // Simulate a crash in the middle of writing the last record.
    let length = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(length - 5).unwrap();

    let keyspace = Keyspace::new(16, Arc::new(ManualClock::new(0)));
    let mut applier = LogApplier::new(&keyspace);
    let report = replay_file(&path, |command| applier.apply(&command).unwrap()).unwrap();

    // SELECT plus the two complete SETs.
    assert_eq!(report.applied, 3);
    assert!(report.truncated);
    assert_eq!(string_value(&keyspace, 0, "a").as_deref(), Some("1"));
    assert_eq!(string_value(&keyspace, 0, "b").as_deref(), Some("2"));
    assert!(!keyspace.exists(0, b"c").unwrap());
}

#[test]
fn test_engine_starts_from_truncated_log() {
    let env = TestEnv::append_only();
    env.set(0, "a", "1");
    env.set(0, "b", "2");
    env.engine.shutdown().unwrap();

    let path = env.engine.config().append_path();
    let length = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(length - 3)
        .unwrap();

    let env = env.restart();
    assert_eq!(
        env.engine.load_source(),
        LoadSource::DurableLog {
            applied: 2,
            skipped: 0,
            truncated: true
        }
    );
    assert_eq!(env.get_string(0, "a").as_deref(), Some("1"));
    assert_eq!(env.get_string(0, "b"), None);

    // The partial record was cut off, so later appends replay cleanly.
    env.set(0, "c", "3");
    let env = env.restart();
    assert_eq!(
        env.engine.load_source(),
        LoadSource::DurableLog {
            applied: 4,
            skipped: 0,
            truncated: false
        }
    );
    assert_eq!(env.get_string(0, "c").as_deref(), Some("3"));
}

#[test]
fn test_rewrite_compacts_and_survives_restart() {
    let env = TestEnv::append_only();
    for i in 0..200 {
        env.set(i % 2, "counter", &i.to_string());
    }
    env.set(0, "gone", "x");
    env.del(0, "gone");
    env.engine.shutdown().unwrap();

    let path = env.engine.config().append_path();
    let before = std::fs::metadata(&path).unwrap().len();

    env.engine.rewrite_log().unwrap();
    env.engine.shutdown().unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before / 10, "{} -> {}", before, after);

    let expected = sorted(env.engine.keyspace().snapshot());
    let env = env.restart();
    assert_eq!(sorted(env.engine.keyspace().snapshot()), expected);
    assert_eq!(env.get_string(0, "counter").as_deref(), Some("198"));
    assert_eq!(env.get_string(1, "counter").as_deref(), Some("199"));
}

#[test]
fn test_rewrite_during_concurrent_writes_loses_nothing() {
    let env = Arc::new(TestEnv::append_only());
    for i in 0..100 {
        env.set(i % 4, &format!("seed:{}", i), "v");
    }

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let env = Arc::clone(&env);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut i = 0usize;
            while !done.load(Ordering::Relaxed) || i < 500 {
                let db = i % 4;
                env.set(db, &format!("live:{}", i % 50), &i.to_string());
                if i % 7 == 0 {
                    env.del(db, &format!("seed:{}", i % 100));
                }
                i += 1;
            }
        })
    };

    for _ in 0..5 {
        env.engine.rewrite_log().unwrap();
        assert_eq!(env.engine.log().unwrap().rewrite_state(), RewriteState::Idle);
    }
    done.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    env.engine.shutdown().unwrap();

    let replayed = replay_into_fresh_keyspace(&env.engine.config().append_path());
    assert_eq!(
        sorted(replayed.snapshot()),
        sorted(env.engine.keyspace().snapshot())
    );
}

#[test]
fn test_second_rewrite_is_rejected_while_one_runs() {
    let env = TestEnv::append_only();
    let log = env.engine.log().unwrap();

    log.begin_rewrite().unwrap();
    assert!(env.engine.rewrite_log().is_err());
    assert_eq!(log.rewrite_state(), RewriteState::Rewriting);

    log.finish_rewrite(&env.engine.keyspace().snapshot()).unwrap();
    assert_eq!(log.rewrite_state(), RewriteState::Idle);
}
