//! Applies logged commands straight to a keyspace.
//!
//! Replay must not go back through the write sequencer (that would log
//! every record a second time), so the durable log carries its own small
//! interpreter for the commands it writes itself: the reconstruction
//! vocabulary of a rewrite plus the bookkeeping commands the engine emits.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use thiserror::Error;

use crate::key_value_store::{parse_score, Entry, SortedSet, Value, ValueKind};
use crate::keyspace::{Keyspace, KeyspaceError};

#[derive(Error, Debug, PartialEq)]
pub enum ApplyError {
    #[error("empty command")]
    EmptyCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("value is not an integer or out of range")]
    InvalidInteger,
    #[error("value is not a valid float")]
    InvalidScore,
    #[error("syntax error")]
    Syntax,
    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),
}

/// Handles commands [`LogApplier`] does not know.
pub type ApplyFallback<'a> = Box<dyn FnMut(&Keyspace, usize, &[Bytes]) -> Result<(), ApplyError> + 'a>;

/// Replays a command stream against a keyspace, tracking `SELECT`.
pub struct LogApplier<'a> {
    keyspace: &'a Keyspace,
    db: usize,
    fallback: Option<ApplyFallback<'a>>,
}

/// Parsed arguments of a logged SET.
#[derive(Debug, PartialEq)]
struct SetArguments {
    key: Bytes,
    value: Bytes,
    expires_at: Option<u64>,
    keep_ttl: bool,
    only_if_absent: bool,
    only_if_present: bool,
}

impl SetArguments {
    /// Parses `SET key value [EX s|PX ms|EXAT s|PXAT ms|KEEPTTL] [NX|XX] [GET]`.
    ///
    /// Relative expirations are resolved against `now`.
    fn parse(arguments: &[Bytes], now: u64) -> Result<Self, ApplyError> {
        if arguments.len() < 2 {
            return Err(ApplyError::WrongArity("set".to_string()));
        }

        let mut parsed = Self {
            key: arguments[0].clone(),
            value: arguments[1].clone(),
            expires_at: None,
            keep_ttl: false,
            only_if_absent: false,
            only_if_present: false,
        };

        let mut options = arguments[2..].iter();
        while let Some(option) = options.next() {
            let option = String::from_utf8_lossy(option).to_ascii_uppercase();
            match option.as_str() {
                "NX" => parsed.only_if_absent = true,
                "XX" => parsed.only_if_present = true,
                "GET" => {}
                "KEEPTTL" => parsed.keep_ttl = true,
                "EX" | "PX" | "EXAT" | "PXAT" => {
                    let amount = parse_u64(options.next().ok_or(ApplyError::Syntax)?)?;
                    parsed.expires_at = Some(match option.as_str() {
                        "EX" => now.saturating_add(amount.saturating_mul(1000)),
                        "PX" => now.saturating_add(amount),
                        "EXAT" => amount.saturating_mul(1000),
                        _ => amount,
                    });
                }
                _ => return Err(ApplyError::Syntax),
            }
        }

        Ok(parsed)
    }
}

impl<'a> LogApplier<'a> {
    pub fn new(keyspace: &'a Keyspace) -> Self {
        Self {
            keyspace,
            db: 0,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: ApplyFallback<'a>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Database selected by the last `SELECT` applied.
    pub fn selected_db(&self) -> usize {
        self.db
    }

    /// Applies one command (name first).
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The command was applied
    /// * `Err(ApplyError::UnknownCommand)` - Not part of the log vocabulary
    ///   and no fallback is installed
    /// * `Err(ApplyError)` - The command is malformed or targets a key of the
    ///   wrong kind; nothing was changed
    pub fn apply(&mut self, command: &[Bytes]) -> Result<(), ApplyError> {
        let Some((name, arguments)) = command.split_first() else {
            return Err(ApplyError::EmptyCommand);
        };

        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        let keyspace = self.keyspace;
        let db = self.db;

        match name.as_str() {
            "select" => {
                let [index] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                let index = parse_u64(index)? as usize;
                if index >= keyspace.database_count() {
                    return Err(KeyspaceError::DatabaseOutOfRange {
                        index,
                        count: keyspace.database_count(),
                    }
                    .into());
                }
                self.db = index;
            }
            "set" => {
                let set = SetArguments::parse(arguments, keyspace.now())?;
                let existing = keyspace.get(db, &set.key)?;

                if (set.only_if_absent && existing.is_some())
                    || (set.only_if_present && existing.is_none())
                {
                    return Ok(());
                }

                let expires_at = match (set.keep_ttl, existing) {
                    (true, Some(entry)) => entry.expires_at,
                    _ => set.expires_at,
                };

                keyspace.put(
                    db,
                    set.key,
                    Entry::with_expiry(Value::String(set.value), expires_at),
                )?;
            }
            "del" | "unlink" => {
                if arguments.is_empty() {
                    return Err(ApplyError::WrongArity(name));
                }
                for key in arguments {
                    keyspace.remove(db, key)?;
                }
            }
            "rpush" | "lpush" => {
                let [key, items @ ..] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                if items.is_empty() {
                    return Err(ApplyError::WrongArity(name));
                }
                let front = name == "lpush";
                self.upsert(key, ValueKind::List, |value| {
                    if let Value::List(list) = value {
                        for item in items {
                            if front {
                                list.push_front(item.clone());
                            } else {
                                list.push_back(item.clone());
                            }
                        }
                    }
                })?;
            }
            "hset" | "hmset" => {
                let [key, pairs @ ..] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                if pairs.is_empty() || pairs.len() % 2 != 0 {
                    return Err(ApplyError::WrongArity(name));
                }
                self.upsert(key, ValueKind::Hash, |value| {
                    if let Value::Hash(map) = value {
                        for pair in pairs.chunks_exact(2) {
                            map.insert(pair[0].clone(), pair[1].clone());
                        }
                    }
                })?;
            }
            "sadd" => {
                let [key, members @ ..] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                if members.is_empty() {
                    return Err(ApplyError::WrongArity(name));
                }
                self.upsert(key, ValueKind::Set, |value| {
                    if let Value::Set(set) = value {
                        set.extend(members.iter().cloned());
                    }
                })?;
            }
            "zadd" => {
                let [key, pairs @ ..] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                if pairs.is_empty() || pairs.len() % 2 != 0 {
                    return Err(ApplyError::WrongArity(name));
                }
                let scored = pairs
                    .chunks_exact(2)
                    .map(|pair| {
                        let score = std::str::from_utf8(&pair[0])
                            .ok()
                            .and_then(parse_score)
                            .ok_or(ApplyError::InvalidScore)?;
                        Ok((pair[1].clone(), score))
                    })
                    .collect::<Result<Vec<_>, ApplyError>>()?;

                self.upsert(key, ValueKind::SortedSet, |value| {
                    if let Value::SortedSet(zset) = value {
                        for (member, score) in scored {
                            zset.insert(member, score);
                        }
                    }
                })?;
            }
            "pexpireat" | "expireat" | "pexpire" | "expire" => {
                let [key, amount] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                let amount = parse_u64(amount)?;
                let now = keyspace.now();
                let expires_at = match name.as_str() {
                    "pexpireat" => amount,
                    "expireat" => amount.saturating_mul(1000),
                    "pexpire" => now.saturating_add(amount),
                    _ => now.saturating_add(amount.saturating_mul(1000)),
                };
                keyspace.set_expiry(db, key, Some(expires_at))?;
            }
            "persist" => {
                let [key] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                keyspace.set_expiry(db, key, None)?;
            }
            "flushdb" => keyspace.clear(db)?,
            "flushall" => keyspace.clear_all(),
            "swapdb" => {
                let [a, b] = arguments else {
                    return Err(ApplyError::WrongArity(name));
                };
                keyspace.swap(parse_u64(a)? as usize, parse_u64(b)? as usize)?;
            }
            _ => match self.fallback.as_mut() {
                Some(fallback) => fallback(keyspace, db, command)?,
                None => return Err(ApplyError::UnknownCommand(name)),
            },
        }

        Ok(())
    }

    /// Mutates the collection under `key`, creating an empty one of `kind`
    /// first if the key does not exist.
    fn upsert(
        &self,
        key: &Bytes,
        kind: ValueKind,
        mutate: impl FnOnce(&mut Value),
    ) -> Result<(), ApplyError> {
        let keyspace = self.keyspace;

        // The kind check runs before `mutate` is moved into the update.
        if let Some(entry) = keyspace.get(self.db, key)? {
            entry.expect_kind(kind)?;
            keyspace.update(self.db, key, |entry| mutate(entry.value_mut()))?;
            return Ok(());
        }

        let mut value = empty_collection(kind);
        mutate(&mut value);
        keyspace.put(self.db, key.clone(), Entry::new(value))?;
        Ok(())
    }
}

fn empty_collection(kind: ValueKind) -> Value {
    match kind {
        ValueKind::String => Value::String(Bytes::new()),
        ValueKind::List => Value::List(VecDeque::new()),
        ValueKind::Hash => Value::Hash(HashMap::new()),
        ValueKind::Set => Value::Set(HashSet::new()),
        ValueKind::SortedSet => Value::SortedSet(SortedSet::new()),
    }
}

fn parse_u64(argument: &[u8]) -> Result<u64, ApplyError> {
    std::str::from_utf8(argument)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or(ApplyError::InvalidInteger)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::time::ManualClock;

    fn command(args: &[&str]) -> Vec<Bytes> {
        args.iter()
            .map(|arg| Bytes::copy_from_slice(arg.as_bytes()))
            .collect()
    }

    fn keyspace() -> Keyspace {
        Keyspace::new(16, Arc::new(ManualClock::new(10_000)))
    }

    #[test]
    fn test_apply_builds_every_value_kind() {
        let keyspace = keyspace();
        let mut applier = LogApplier::new(&keyspace);

        let commands = vec![
            vec!["SELECT", "2"],
            vec!["SET", "s", "v"],
            vec!["RPUSH", "l", "b", "c"],
            vec!["LPUSH", "l", "a"],
            vec!["HSET", "h", "f1", "1", "f2", "2"],
            vec!["SADD", "set", "x", "y", "x"],
            vec!["ZADD", "z", "2", "two", "-inf", "bottom"],
        ];
        for args in commands {
            applier.apply(&command(&args)).unwrap();
        }

        assert_eq!(applier.selected_db(), 2);
        assert_eq!(keyspace.size(0).unwrap(), 0);
        assert_eq!(
            keyspace.get(2, b"l").unwrap().map(Entry::into_value),
            Some(Value::List(VecDeque::from([
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ])))
        );

        let Some(Value::Hash(hash)) = keyspace.get(2, b"h").unwrap().map(Entry::into_value) else {
            panic!("expected a hash");
        };
        assert_eq!(hash.len(), 2);

        let Some(Value::Set(set)) = keyspace.get(2, b"set").unwrap().map(Entry::into_value) else {
            panic!("expected a set");
        };
        assert_eq!(set.len(), 2);

        let Some(Value::SortedSet(zset)) = keyspace.get(2, b"z").unwrap().map(Entry::into_value)
        else {
            panic!("expected a sorted set");
        };
        assert_eq!(zset.score(b"bottom"), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_apply_set_options() {
        let keyspace = keyspace();
        let mut applier = LogApplier::new(&keyspace);

        let test_cases = vec![
            (vec!["SET", "a", "1", "PX", "500"], Some(10_500)),
            (vec!["SET", "b", "1", "EX", "2"], Some(12_000)),
            (vec!["SET", "c", "1", "PXAT", "99999"], Some(99_999)),
            (vec!["SET", "d", "1"], None),
        ];

        for (args, expires_at) in test_cases {
            applier.apply(&command(&args)).unwrap();
            let key = args[1].as_bytes();
            assert_eq!(keyspace.get(0, key).unwrap().unwrap().expires_at, expires_at);
        }

        applier.apply(&command(&["SET", "d", "2", "NX"])).unwrap();
        assert_eq!(
            keyspace.get(0, b"d").unwrap().map(Entry::into_value),
            Some(Value::from("1"))
        );
        assert_eq!(
            applier.apply(&command(&["SET", "d", "2", "EX"])),
            Err(ApplyError::Syntax)
        );
    }

    #[test]
    fn test_apply_expiry_delete_and_database_commands() {
        let keyspace = keyspace();
        let mut applier = LogApplier::new(&keyspace);

        for args in [
            vec!["SET", "a", "1"],
            vec!["SET", "b", "1"],
            vec!["PEXPIREAT", "a", "20000"],
            vec!["DEL", "b"],
            vec!["SWAPDB", "0", "5"],
        ] {
            applier.apply(&command(&args)).unwrap();
        }

        assert_eq!(keyspace.size(0).unwrap(), 0);
        assert_eq!(keyspace.get(5, b"a").unwrap().unwrap().expires_at, Some(20_000));
        assert!(!keyspace.exists(5, b"b").unwrap());

        applier.apply(&command(&["SELECT", "5"])).unwrap();
        applier.apply(&command(&["FLUSHDB"])).unwrap();
        assert_eq!(keyspace.size(5).unwrap(), 0);
    }

    #[test]
    fn test_apply_rejects_bad_commands() {
        let keyspace = keyspace();
        let mut applier = LogApplier::new(&keyspace);
        applier.apply(&command(&["SET", "s", "v"])).unwrap();

        let test_cases = vec![
            (vec![], ApplyError::EmptyCommand),
            (vec!["GETDEL", "s"], ApplyError::UnknownCommand("getdel".into())),
            (vec!["SELECT"], ApplyError::WrongArity("select".into())),
            (vec!["SELECT", "x"], ApplyError::InvalidInteger),
            (
                vec!["SELECT", "16"],
                ApplyError::Keyspace(KeyspaceError::DatabaseOutOfRange {
                    index: 16,
                    count: 16,
                }),
            ),
            (vec!["ZADD", "z", "nan", "m"], ApplyError::InvalidScore),
            (
                vec!["RPUSH", "s", "x"],
                ApplyError::Keyspace(KeyspaceError::WrongType {
                    expected: ValueKind::List,
                    found: ValueKind::String,
                }),
            ),
        ];

        for (args, expected) in test_cases {
            assert_eq!(applier.apply(&command(&args)), Err(expected), "{:?}", args);
        }
    }

    #[test]
    fn test_fallback_receives_unknown_commands() {
        let keyspace = keyspace();
        let mut seen = Vec::new();

        {
            let mut applier = LogApplier::new(&keyspace).with_fallback(Box::new(|_, db, args| {
                seen.push((db, args[0].clone()));
                Ok(())
            }));
            applier.apply(&command(&["SELECT", "3"])).unwrap();
            applier.apply(&command(&["INCR", "n"])).unwrap();
        }

        assert_eq!(seen, vec![(3, Bytes::from_static(b"INCR"))]);
    }
}
