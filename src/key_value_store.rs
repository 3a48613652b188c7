//! Stored values and the entries that wrap them.
//!
//! A [`Value`] is a closed set of the collection kinds the engine can
//! persist. An [`Entry`] pairs a value with its absolute expiration and the
//! last time it was read, which eviction uses to rank candidates.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use bytes::Bytes;

use crate::keyspace::KeyspaceError;

/// Fixed bookkeeping cost charged to every entry on top of its payload.
const ENTRY_OVERHEAD: usize = 48;
/// Per-element bookkeeping cost for collection members.
const ELEMENT_OVERHEAD: usize = 16;

/// The kind of a stored value, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    List,
    Hash,
    Set,
    SortedSet,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Hash => "hash",
            ValueKind::Set => "set",
            ValueKind::SortedSet => "zset",
        };
        write!(f, "{}", name)
    }
}

/// A typed value payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
    SortedSet(SortedSet),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Hash(_) => ValueKind::Hash,
            Value::Set(_) => ValueKind::Set,
            Value::SortedSet(_) => ValueKind::SortedSet,
        }
    }

    /// Rough number of heap bytes held by the payload.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::String(bytes) => bytes.len(),
            Value::List(list) => list.iter().map(|item| item.len() + ELEMENT_OVERHEAD).sum(),
            Value::Hash(map) => map
                .iter()
                .map(|(field, value)| field.len() + value.len() + ELEMENT_OVERHEAD)
                .sum(),
            Value::Set(set) => set.iter().map(|member| member.len() + ELEMENT_OVERHEAD).sum(),
            Value::SortedSet(zset) => zset
                .iter()
                .map(|(member, _)| member.len() + 8 + 2 * ELEMENT_OVERHEAD)
                .sum(),
        }
    }

    /// True when the value is an empty collection.
    ///
    /// Strings are never considered empty: `SET k ""` is a valid key.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::List(list) => list.is_empty(),
            Value::Hash(map) => map.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::SortedSet(zset) => zset.is_empty(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::String(value)
    }
}

/// One stored value with its expiration and access metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    value: Value,
    /// Absolute Unix epoch milliseconds; `None` means the entry never expires.
    pub expires_at: Option<u64>,
    /// Unix epoch milliseconds of the last read or write.
    pub last_accessed: u64,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
            last_accessed: 0,
        }
    }

    pub fn with_expiry(value: Value, expires_at: Option<u64>) -> Self {
        Self {
            value,
            expires_at,
            last_accessed: 0,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Mutable access to the payload. The payload kind stays fixed: callers
    /// mutate the collection in place, they do not swap the variant.
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// Fails with [`KeyspaceError::WrongType`] unless the entry holds `kind`.
    pub fn expect_kind(&self, kind: ValueKind) -> Result<(), KeyspaceError> {
        if self.kind() == kind {
            Ok(())
        } else {
            Err(KeyspaceError::WrongType {
                expected: kind,
                found: self.kind(),
            })
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    pub fn touch(&mut self, now: u64) {
        self.last_accessed = now;
    }

    /// Estimated memory footprint of a key holding this entry.
    pub fn estimated_size(&self, key: &[u8]) -> usize {
        ENTRY_OVERHEAD + key.len() + self.value.estimated_size()
    }
}

/// Score wrapper ordering `f64` totally, so scores can live in a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by (score, member) with O(1) score lookup.
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    ordered: BTreeSet<(Score, Bytes)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or rescored `member`. Returns `true` when the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(previous) => {
                self.ordered.remove(&(Score(previous), member.clone()));
                self.ordered.insert((Score(score), member));
                false
            }
            None => {
                self.ordered.insert((Score(score), member));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> Option<f64> {
        let (member, score) = self.scores.remove_entry(member)?;
        self.ordered.remove(&(Score(score), member));
        Some(score)
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members in ascending (score, member) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> + '_ {
        self.ordered.iter().map(|(score, member)| (member, score.0))
    }
}

impl PartialEq for SortedSet {
    fn eq(&self, other: &Self) -> bool {
        self.ordered == other.ordered
    }
}

impl FromIterator<(Bytes, f64)> for SortedSet {
    fn from_iter<T: IntoIterator<Item = (Bytes, f64)>>(iter: T) -> Self {
        let mut zset = SortedSet::new();
        for (member, score) in iter {
            zset.insert(member, score);
        }
        zset
    }
}

/// Formats a score the way it is written to snapshots and logs: integral
/// values without a fraction, infinities as `inf`/`-inf`.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", score)
    }
}

/// Parses a score written by [`format_score`] or by another producer.
pub fn parse_score(text: &str) -> Option<f64> {
    match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok().filter(|score| !score.is_nan()),
    }
}
