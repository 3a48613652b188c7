//! Memory-ceiling eviction.
//!
//! Candidates are drawn from a per-database cursor over the map rather than
//! from a full scan: each attempt looks at the next [`EVICTION_SAMPLE_SIZE`]
//! keys (or the next single key for the random policies) and wraps around
//! at the end. The chosen candidate is removed with a conditional removal
//! that re-checks eligibility, so a key rewritten between sampling and
//! removal is re-evaluated instead of being evicted blindly.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use dashmap::mapref::multiple::RefMulti;
use tracing::{debug, trace};

use super::{Database, Keyspace, KeyspaceError, KeyspaceEvent};
use crate::key_value_store::Entry;

/// Keys examined per LRU eviction attempt.
pub const EVICTION_SAMPLE_SIZE: usize = 5;
/// Upper bound on attempts per eviction round.
const MAX_EVICTION_ATTEMPTS: usize = 100;
/// `maybe_evict` only does real work on every Nth write.
const EVICTION_CHECK_INTERVAL: u64 = 50;

/// Policy for evicting keys when the memory ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Never evict.
    #[default]
    NoEviction,
    /// Evict the least recently used of a sample of any keys.
    AllKeysLru,
    /// Evict whichever key the cursor lands on.
    AllKeysRandom,
    /// Like `AllKeysLru`, restricted to keys with an expiration.
    VolatileLru,
    /// Like `AllKeysRandom`, restricted to keys with an expiration.
    VolatileRandom,
}

impl EvictionPolicy {
    pub fn can_evict(&self) -> bool {
        !matches!(self, EvictionPolicy::NoEviction)
    }

    fn is_lru(&self) -> bool {
        matches!(self, EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru)
    }

    fn is_volatile(&self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru | EvictionPolicy::VolatileRandom
        )
    }

    /// Whether `entry` may be evicted under this policy.
    pub fn is_eligible(&self, entry: &Entry) -> bool {
        self.can_evict() && (!self.is_volatile() || entry.expires_at.is_some())
    }
}

impl FromStr for EvictionPolicy {
    type Err = KeyspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "noeviction" => Ok(EvictionPolicy::NoEviction),
            "allkeyslru" => Ok(EvictionPolicy::AllKeysLru),
            "allkeysrandom" => Ok(EvictionPolicy::AllKeysRandom),
            "volatilelru" => Ok(EvictionPolicy::VolatileLru),
            "volatilerandom" => Ok(EvictionPolicy::VolatileRandom),
            _ => Err(KeyspaceError::UnknownEvictionPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionPolicy::NoEviction => "noeviction",
            EvictionPolicy::AllKeysLru => "allkeys-lru",
            EvictionPolicy::AllKeysRandom => "allkeys-random",
            EvictionPolicy::VolatileLru => "volatile-lru",
            EvictionPolicy::VolatileRandom => "volatile-random",
        };
        write!(f, "{}", name)
    }
}

/// What the sampler saw of one key.
struct Candidate {
    key: Bytes,
    last_accessed: u64,
    has_expiry: bool,
}

impl Keyspace {
    /// Cheap pre-write check: every [`EVICTION_CHECK_INTERVAL`]th call runs
    /// [`Keyspace::evict`] if memory is over the ceiling.
    pub fn maybe_evict(&self, db: usize) -> Result<usize, KeyspaceError> {
        let limits = *self.limits.read();
        if limits.max_memory == 0 || !limits.policy.can_evict() {
            return Ok(0);
        }

        let writes = self.write_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % EVICTION_CHECK_INTERVAL != 0 || self.used_memory() <= limits.max_memory {
            return Ok(0);
        }

        self.evict(db)
    }

    /// Evicts keys from `db` until memory is at or below the ceiling, the
    /// database is empty, or the attempt budget runs out.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of keys evicted
    /// * `Err(KeyspaceError)` - `db` is out of range
    pub fn evict(&self, db: usize) -> Result<usize, KeyspaceError> {
        let database = self.database(db)?;
        let limits = *self.limits.read();

        if limits.max_memory == 0 || !limits.policy.can_evict() {
            return Ok(0);
        }

        let policy = limits.policy;
        let mut evicted = 0;
        let mut attempts = 0;

        while self.used_memory() > limits.max_memory
            && !database.entries.is_empty()
            && attempts < MAX_EVICTION_ATTEMPTS
        {
            attempts += 1;

            let sample_size = if policy.is_lru() {
                EVICTION_SAMPLE_SIZE
            } else {
                1
            };

            let Some(victim) = sample(&database, sample_size)
                .into_iter()
                .filter(|candidate| !policy.is_volatile() || candidate.has_expiry)
                .min_by_key(|candidate| candidate.last_accessed)
            else {
                continue;
            };

            if let Some((key, entry)) = database
                .entries
                .remove_if(&victim.key[..], |_, entry| policy.is_eligible(entry))
            {
                database.sub_memory(entry.estimated_size(&key));
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                trace!(db, key = ?key, "evicted key");
                self.notify(db, &key, KeyspaceEvent::Evicted);
                evicted += 1;
            }
        }

        debug!(
            db,
            evicted,
            attempts,
            used_memory = self.used_memory(),
            max_memory = limits.max_memory,
            %policy,
            "eviction round finished"
        );

        Ok(evicted)
    }
}

/// Takes up to `count` keys starting at the database's eviction cursor,
/// wrapping to the beginning when the end of the map is reached.
fn sample(database: &Database, count: usize) -> Vec<Candidate> {
    let start = database.eviction_cursor.load(Ordering::Relaxed);
    let mut sampled: Vec<Candidate> = database
        .entries
        .iter()
        .skip(start)
        .take(count)
        .map(describe)
        .collect();

    if sampled.len() == count {
        database
            .eviction_cursor
            .store(start + count, Ordering::Relaxed);
        return sampled;
    }

    let remaining = if start > 0 { count - sampled.len() } else { 0 };
    sampled.extend(database.entries.iter().take(remaining).map(describe));
    database.eviction_cursor.store(remaining, Ordering::Relaxed);
    sampled
}

fn describe(item: RefMulti<'_, Bytes, Entry>) -> Candidate {
    Candidate {
        key: item.key().clone(),
        last_accessed: item.value().last_accessed,
        has_expiry: item.value().expires_at.is_some(),
    }
}
