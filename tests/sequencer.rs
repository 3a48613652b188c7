mod test_utils;

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;

use redis_engine::aof::replay_file;
use redis_engine::key_value_store::{Entry, Value};
use redis_engine::replication::PsyncRequest;
use redis_engine::resp::encode_command;
use test_utils::{bytes, decode_all, without_selects, TestEnv};

const WRITERS: usize = 4;
const WRITES_PER_WRITER: usize = 50;

#[tokio::test]
async fn test_log_backlog_and_followers_see_the_same_order() {
    let env = Arc::new(TestEnv::append_only());
    let mut first = env.engine.psync(&PsyncRequest {
        replication_id: None,
        offset: None,
    });
    let mut second = env.engine.psync(&PsyncRequest {
        replication_id: None,
        offset: None,
    });
    let start_offset = env.engine.backlog().offset();

    // Order in which mutations actually hit the keyspace.
    let applied: Arc<Mutex<Vec<Vec<Bytes>>>> = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let env = Arc::clone(&env);
            let applied = Arc::clone(&applied);

            thread::spawn(move || {
                for i in 0..WRITES_PER_WRITER {
                    let db = (writer + i) % 3;
                    let key = format!("w{}:{}", writer, i % 7);
                    let value = i.to_string();
                    let command = encode_command(["SET", key.as_str(), value.as_str()]);

                    env.engine.execute_write(
                        db,
                        |keyspace| {
                            keyspace
                                .put(db, bytes(&key), Entry::new(Value::from(value.as_str())))
                                .unwrap();
                            applied.lock().push(vec![
                                Bytes::from("SET"),
                                bytes(&key),
                                bytes(&value),
                            ]);
                        },
                        command,
                    );
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    env.engine.shutdown().unwrap();

    let applied = applied.lock().clone();
    assert_eq!(applied.len(), WRITERS * WRITES_PER_WRITER);

    let backlog = env
        .engine
        .backlog()
        .read_from(start_offset, usize::MAX)
        .unwrap();
    assert_eq!(without_selects(decode_all(&backlog)), applied);

    for session in [&mut first, &mut second] {
        let mut stream = Vec::new();
        while let Ok(chunk) = session.stream.try_recv() {
            stream.extend_from_slice(&chunk);
        }
        assert_eq!(without_selects(decode_all(&stream)), applied);
    }

    let mut logged = Vec::new();
    replay_file(env.engine.config().append_path(), |command| logged.push(command)).unwrap();
    assert_eq!(without_selects(logged), applied);
}

#[test]
fn test_select_precedes_writes_to_a_new_database() {
    let env = TestEnv::append_only();
    env.set(0, "a", "1");
    env.set(4, "b", "2");
    env.set(4, "c", "3");
    env.set(0, "d", "4");

    let stream = env.engine.backlog().read_from(0, usize::MAX).unwrap();
    let names: Vec<String> = decode_all(&stream)
        .iter()
        .map(|command| {
            command
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    assert_eq!(
        names,
        vec![
            "SELECT 0", "SET a 1", "SELECT 4", "SET b 2", "SET c 3", "SELECT 0", "SET d 4",
        ]
    );
}

#[test]
fn test_failed_mutation_reaches_no_stream() {
    let env = TestEnv::append_only();
    env.set(0, "list", "not a list");

    let before = env.engine.backlog().offset();
    let result = env.engine.try_execute_write(
        0,
        |keyspace| {
            keyspace
                .get(0, b"list")?
                .map(|entry| entry.expect_kind(redis_engine::key_value_store::ValueKind::List))
                .transpose()
        },
        encode_command(["RPUSH", "list", "x"]),
    );

    assert!(result.is_err());
    assert_eq!(env.engine.backlog().offset(), before);

    env.engine.shutdown().unwrap();
    let mut logged = Vec::new();
    replay_file(env.engine.config().append_path(), |command| logged.push(command)).unwrap();
    assert_eq!(without_selects(logged).len(), 1);
}
