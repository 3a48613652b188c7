#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use redis_engine::config::EngineConfig;
use redis_engine::engine::Engine;
use redis_engine::key_value_store::{Entry, Value};
use redis_engine::keyspace::{Keyspace, KeyspaceSnapshot};
use redis_engine::resp::{decode_command, encode_command};
use redis_engine::time::ManualClock;

/// Test environment owning a temporary data directory
pub struct TestEnv {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
}

impl TestEnv {
    /// An engine with append-only persistence on, in a fresh directory
    pub fn append_only() -> Self {
        Self::with_config(|config| config.append_only = true)
    }

    pub fn with_config(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        configure(&mut config);

        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = Engine::open_with_clock(config, clock.clone()).unwrap();

        Self { dir, clock, engine }
    }

    /// Reopens the engine on the same directory and clock.
    pub fn restart(self) -> Self {
        let TestEnv { dir, clock, engine } = self;
        let config = engine.config().clone();
        engine.shutdown().unwrap();
        drop(engine);

        let engine = Engine::open_with_clock(config, clock.clone()).unwrap();
        Self { dir, clock, engine }
    }

    /// `SET key value` through the sequencer
    pub fn set(&self, db: usize, key: &str, value: &str) {
        self.engine
            .try_execute_write(
                db,
                |keyspace| keyspace.put(db, bytes(key), Entry::new(Value::from(value))),
                encode_command(["SET", key, value]),
            )
            .unwrap();
    }

    /// `DEL key` through the sequencer
    pub fn del(&self, db: usize, key: &str) {
        self.engine
            .try_execute_write(
                db,
                |keyspace| keyspace.remove(db, key.as_bytes()),
                encode_command(["DEL", key]),
            )
            .unwrap();
    }

    pub fn get_string(&self, db: usize, key: &str) -> Option<String> {
        string_value(self.engine.keyspace(), db, key)
    }
}

pub fn bytes(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

pub fn string_value(keyspace: &Keyspace, db: usize, key: &str) -> Option<String> {
    match keyspace.get(db, key.as_bytes()).unwrap()?.into_value() {
        Value::String(value) => Some(String::from_utf8(value.to_vec()).unwrap()),
        other => panic!("expected a string, got {:?}", other),
    }
}

/// Decodes a buffer of back-to-back RESP commands.
pub fn decode_all(mut buffer: &[u8]) -> Vec<Vec<Bytes>> {
    let mut commands = Vec::new();
    while let Some((command, consumed)) = decode_command(buffer).unwrap() {
        commands.push(command);
        buffer = &buffer[consumed..];
    }
    assert!(buffer.is_empty(), "trailing bytes in stream");
    commands
}

/// Drops `SELECT` commands, which each stream places independently.
pub fn without_selects(commands: Vec<Vec<Bytes>>) -> Vec<Vec<Bytes>> {
    commands
        .into_iter()
        .filter(|command| !command[0].eq_ignore_ascii_case(b"SELECT"))
        .collect()
}

/// Snapshot contents with each database sorted by key, for comparisons
/// that should ignore map iteration order.
pub fn sorted(mut snapshot: KeyspaceSnapshot) -> Vec<Vec<(Bytes, Value, Option<u64>)>> {
    snapshot
        .databases
        .iter_mut()
        .map(|entries| {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
                .drain(..)
                .map(|(key, entry)| {
                    let expires_at = entry.expires_at;
                    (key, entry.into_value(), expires_at)
                })
                .collect()
        })
        .collect()
}
