use std::io::{self, Write};

use bytes::Bytes;

use crate::key_value_store::{format_score, Entry, Value};
use crate::keyspace::KeyspaceSnapshot;
use crate::resp::encode_command;

use super::select_command;

/// The commands that recreate `key` holding `entry` from nothing.
///
/// Collections get one command per element so no record grows with the
/// size of the collection. An expiration is restored with an absolute
/// `PEXPIREAT`, which replays correctly no matter when it runs.
pub fn reconstruction_commands(key: &Bytes, entry: &Entry) -> Vec<Bytes> {
    let mut commands: Vec<Bytes> = match entry.value() {
        Value::String(value) => vec![encode_command([&b"SET"[..], &key[..], &value[..]])],
        Value::List(list) => list
            .iter()
            .map(|item| encode_command([&b"RPUSH"[..], &key[..], &item[..]]))
            .collect(),
        Value::Hash(map) => map
            .iter()
            .map(|(field, value)| {
                encode_command([&b"HSET"[..], &key[..], &field[..], &value[..]])
            })
            .collect(),
        Value::Set(set) => set
            .iter()
            .map(|member| encode_command([&b"SADD"[..], &key[..], &member[..]]))
            .collect(),
        Value::SortedSet(zset) => zset
            .iter()
            .map(|(member, score)| {
                let score = format_score(score);
                encode_command([&b"ZADD"[..], &key[..], score.as_bytes(), &member[..]])
            })
            .collect(),
    };

    if let Some(expires_at) = entry.expires_at {
        commands.push(encode_command([
            &b"PEXPIREAT"[..],
            &key[..],
            expires_at.to_string().as_bytes(),
        ]));
    }

    commands
}

/// Writes the reconstruction of every live entry in `snapshot`, one
/// `SELECT` per non-empty database. Returns the number of commands written.
pub fn write_reconstruction<W: Write>(
    out: &mut W,
    snapshot: &KeyspaceSnapshot,
) -> io::Result<usize> {
    let mut written = 0;

    for (db, entries) in snapshot.databases.iter().enumerate() {
        let mut live = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(snapshot.taken_at))
            .peekable();

        if live.peek().is_none() {
            continue;
        }

        out.write_all(&select_command(db))?;
        written += 1;

        for (key, entry) in live {
            for command in reconstruction_commands(key, entry) {
                out.write_all(&command)?;
                written += 1;
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::key_value_store::SortedSet;
    use crate::resp::decode_command;

    fn decode_all(commands: &[Bytes]) -> Vec<Vec<String>> {
        commands
            .iter()
            .map(|command| {
                let (args, _) = decode_command(command).unwrap().unwrap();
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_reconstruction_commands_per_type() {
        let key = Bytes::from_static(b"k");
        let test_cases = vec![
            (
                Entry::new(Value::from("v")),
                vec![vec!["SET", "k", "v"]],
            ),
            (
                Entry::with_expiry(Value::from("v"), Some(1_700_000_000_000)),
                vec![
                    vec!["SET", "k", "v"],
                    vec!["PEXPIREAT", "k", "1700000000000"],
                ],
            ),
            (
                Entry::new(Value::List(VecDeque::from([
                    Bytes::from_static(b"a"),
                    Bytes::from_static(b"b"),
                ]))),
                vec![vec!["RPUSH", "k", "a"], vec!["RPUSH", "k", "b"]],
            ),
            (
                Entry::new(Value::Hash(HashMap::from([(
                    Bytes::from_static(b"f"),
                    Bytes::from_static(b"1"),
                )]))),
                vec![vec!["HSET", "k", "f", "1"]],
            ),
            (
                Entry::new(Value::SortedSet(SortedSet::from_iter([
                    (Bytes::from_static(b"low"), -1.5),
                    (Bytes::from_static(b"top"), f64::INFINITY),
                ]))),
                vec![vec!["ZADD", "k", "-1.5", "low"], vec!["ZADD", "k", "inf", "top"]],
            ),
        ];

        for (entry, expected) in test_cases {
            let expected: Vec<Vec<String>> = expected
                .into_iter()
                .map(|command| command.into_iter().map(String::from).collect())
                .collect();
            assert_eq!(decode_all(&reconstruction_commands(&key, &entry)), expected);
        }
    }

    #[test]
    fn test_write_reconstruction_skips_empty_databases_and_expired_entries() {
        let mut databases = vec![Vec::new(); 4];
        databases[1].push((
            Bytes::from_static(b"gone"),
            Entry::with_expiry(Value::from("x"), Some(5)),
        ));
        databases[3].push((Bytes::from_static(b"kept"), Entry::new(Value::from("y"))));

        let snapshot = KeyspaceSnapshot {
            taken_at: 10,
            databases,
        };

        let mut out = Vec::new();
        assert_eq!(write_reconstruction(&mut out, &snapshot).unwrap(), 2);

        let mut expected = Vec::new();
        expected.extend_from_slice(&encode_command(["SELECT", "3"]));
        expected.extend_from_slice(&encode_command(["SET", "kept", "y"]));
        assert_eq!(out, expected);
    }
}
