//! The keyspace: a fixed set of logical databases.
//!
//! Each database is a concurrent map from key to [`Entry`]. Reads of single
//! entries never need the engine's global lock; whole-database operations
//! (clear, swap) replace the database handle itself, which makes them O(1).
//!
//! Expiration is enforced in two ways. Every access checks the entry's
//! deadline and removes it on the spot (lazy expiry), and [`Keyspace::active_expire`]
//! sweeps all databases so keys nobody reads still go away. Both paths use
//! the same conditional removal, so a sweep racing a writer that just
//! refreshed the key leaves the fresh value alone.

mod eviction;
mod events;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::key_value_store::{Entry, ValueKind};
use crate::time::Clock;

pub use eviction::{EvictionPolicy, EVICTION_SAMPLE_SIZE};
pub use events::{KeyspaceEvent, KeyspaceListener};

/// Number of logical databases a keyspace gets unless configured otherwise.
pub const DEFAULT_DATABASES: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    #[error("database index {index} out of range (0..{count})")]
    DatabaseOutOfRange { index: usize, count: usize },
    #[error("WRONGTYPE operation against a key holding {found}, expected {expected}")]
    WrongType {
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("unknown eviction policy: {0}")]
    UnknownEvictionPolicy(String),
}

/// One logical database.
#[derive(Debug, Default)]
struct Database {
    entries: DashMap<Bytes, Entry>,
    used_memory: AtomicUsize,
    eviction_cursor: AtomicUsize,
}

impl Database {
    fn add_memory(&self, bytes: usize) {
        self.used_memory.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_memory(&self, bytes: usize) {
        let _ = self
            .used_memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

#[derive(Debug, Default)]
struct KeyspaceStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

/// Counters exposed for INFO-style reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyspaceStatsSnapshot {
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub expired_keys: u64,
    pub evicted_keys: u64,
}

/// A point-in-time copy of every live entry, one vector per database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyspaceSnapshot {
    /// Clock reading when the copy was taken.
    pub taken_at: u64,
    pub databases: Vec<Vec<(Bytes, Entry)>>,
}

impl KeyspaceSnapshot {
    pub fn key_count(&self) -> usize {
        self.databases.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryLimits {
    max_memory: usize,
    policy: EvictionPolicy,
}

pub struct Keyspace {
    databases: RwLock<Vec<Arc<Database>>>,
    clock: Arc<dyn Clock>,
    limits: RwLock<MemoryLimits>,
    write_counter: AtomicU64,
    stats: KeyspaceStats,
    listener: RwLock<Option<Arc<dyn KeyspaceListener>>>,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("databases", &self.database_count())
            .field("used_memory", &self.used_memory())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Keyspace {
    pub fn new(database_count: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            databases: RwLock::new(
                (0..database_count.max(1))
                    .map(|_| Arc::new(Database::default()))
                    .collect(),
            ),
            clock,
            limits: RwLock::new(MemoryLimits {
                max_memory: 0,
                policy: EvictionPolicy::NoEviction,
            }),
            write_counter: AtomicU64::new(0),
            stats: KeyspaceStats::default(),
            listener: RwLock::new(None),
        }
    }

    /// Sets the memory ceiling in bytes. Zero disables eviction.
    pub fn set_max_memory(&self, max_memory: usize) {
        self.limits.write().max_memory = max_memory;
    }

    pub fn max_memory(&self) -> usize {
        self.limits.read().max_memory
    }

    pub fn set_eviction_policy(&self, policy: EvictionPolicy) {
        self.limits.write().policy = policy;
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.limits.read().policy
    }

    pub fn set_listener(&self, listener: Arc<dyn KeyspaceListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    fn database(&self, index: usize) -> Result<Arc<Database>, KeyspaceError> {
        let databases = self.databases.read();
        databases
            .get(index)
            .cloned()
            .ok_or(KeyspaceError::DatabaseOutOfRange {
                index,
                count: databases.len(),
            })
    }

    fn check_index(&self, index: usize) -> Result<(), KeyspaceError> {
        let count = self.database_count();
        if index < count {
            Ok(())
        } else {
            Err(KeyspaceError::DatabaseOutOfRange { index, count })
        }
    }

    fn notify(&self, db: usize, key: &Bytes, event: KeyspaceEvent) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_event(db, key, event);
        }
    }

    /// Removes `key` if it is still expired at `now`. Returns `true` when it
    /// was removed by this call.
    fn expire_key(&self, db: usize, database: &Database, key: &[u8], now: u64) -> bool {
        let Some((key, entry)) = database
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
        else {
            return false;
        };

        database.sub_memory(entry.estimated_size(&key));
        self.stats.expired.fetch_add(1, Ordering::Relaxed);
        self.notify(db, &key, KeyspaceEvent::Expired);
        true
    }

    /// Runs `f` on the live entry for `key`, refreshing its access time.
    ///
    /// Handles lazy expiration and hit/miss accounting for every read path.
    fn with_live_entry<R>(
        &self,
        db: usize,
        key: &[u8],
        f: impl FnOnce(&Bytes, &mut Entry) -> R,
    ) -> Result<Option<R>, KeyspaceError> {
        let database = self.database(db)?;
        let now = self.now();

        match database.entries.get_mut(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(mut guard) => {
                if !guard.is_expired(now) {
                    let (key, entry) = guard.pair_mut();
                    entry.touch(now);
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(f(key, entry)));
                }
            }
        }

        self.expire_key(db, &database, key, now);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Returns a copy of the entry stored under `key`, if it is live.
    pub fn get(&self, db: usize, key: &[u8]) -> Result<Option<Entry>, KeyspaceError> {
        self.with_live_entry(db, key, |_, entry| entry.clone())
    }

    pub fn exists(&self, db: usize, key: &[u8]) -> Result<bool, KeyspaceError> {
        Ok(self.with_live_entry(db, key, |_, _| ())?.is_some())
    }

    /// Mutates the live entry under `key` in place.
    ///
    /// Memory accounting follows the change in size. A collection left
    /// empty by `f` is deleted, matching how Redis never keeps empty lists,
    /// hashes, sets or sorted sets around.
    pub fn update<R>(
        &self,
        db: usize,
        key: &[u8],
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Result<Option<R>, KeyspaceError> {
        let database = self.database(db)?;

        let result = self.with_live_entry(db, key, |key, entry| {
            let before = entry.estimated_size(key);
            let result = f(entry);
            let after = entry.estimated_size(key);

            if after >= before {
                database.add_memory(after - before);
            } else {
                database.sub_memory(before - after);
            }

            result
        })?;

        if result.is_some() {
            if let Some((key, entry)) = database
                .entries
                .remove_if(key, |_, entry| entry.value().is_empty_collection())
            {
                database.sub_memory(entry.estimated_size(&key));
                self.notify(db, &key, KeyspaceEvent::Del);
            }
        }

        Ok(result)
    }

    /// Sets or clears the expiration of a live key. Returns `false` when
    /// the key does not exist.
    pub fn set_expiry(
        &self,
        db: usize,
        key: &[u8],
        expires_at: Option<u64>,
    ) -> Result<bool, KeyspaceError> {
        Ok(self
            .update(db, key, |entry| entry.expires_at = expires_at)?
            .is_some())
    }

    /// Inserts or replaces the entry under `key`.
    ///
    /// May evict other keys of the same database first when a memory
    /// ceiling is configured.
    pub fn put(&self, db: usize, key: Bytes, mut entry: Entry) -> Result<(), KeyspaceError> {
        let database = self.database(db)?;
        self.maybe_evict(db)?;

        let now = self.now();
        entry.touch(now);
        database.add_memory(entry.estimated_size(&key));

        let event = match database.entries.insert(key.clone(), entry) {
            Some(previous) => {
                database.sub_memory(previous.estimated_size(&key));
                if previous.is_expired(now) {
                    KeyspaceEvent::New
                } else {
                    KeyspaceEvent::Set
                }
            }
            None => KeyspaceEvent::New,
        };

        self.notify(db, &key, event);
        Ok(())
    }

    /// Removes `key`, returning its entry if it was live.
    pub fn remove(&self, db: usize, key: &[u8]) -> Result<Option<Entry>, KeyspaceError> {
        let database = self.database(db)?;

        let Some((key, entry)) = database.entries.remove(key) else {
            return Ok(None);
        };

        database.sub_memory(entry.estimated_size(&key));

        if entry.is_expired(self.now()) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.notify(db, &key, KeyspaceEvent::Expired);
            return Ok(None);
        }

        self.notify(db, &key, KeyspaceEvent::Del);
        Ok(Some(entry))
    }

    /// Number of keys stored in `db`, including expired keys not yet reclaimed.
    pub fn size(&self, db: usize) -> Result<usize, KeyspaceError> {
        Ok(self.database(db)?.entries.len())
    }

    pub fn clear(&self, db: usize) -> Result<(), KeyspaceError> {
        self.check_index(db)?;
        self.databases.write()[db] = Arc::new(Database::default());
        Ok(())
    }

    pub fn clear_all(&self) {
        let mut databases = self.databases.write();
        for database in databases.iter_mut() {
            *database = Arc::new(Database::default());
        }
    }

    /// Exchanges the contents of two databases.
    pub fn swap(&self, a: usize, b: usize) -> Result<(), KeyspaceError> {
        self.check_index(a)?;
        self.check_index(b)?;
        self.databases.write().swap(a, b);
        Ok(())
    }

    /// Copies of every live entry of `db`. Does not refresh access times.
    pub fn entries(&self, db: usize) -> Result<Vec<(Bytes, Entry)>, KeyspaceError> {
        let database = self.database(db)?;
        let now = self.now();

        Ok(database
            .entries
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect())
    }

    pub fn keys(&self, db: usize) -> Result<Vec<Bytes>, KeyspaceError> {
        let database = self.database(db)?;
        let now = self.now();

        Ok(database
            .entries
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| item.key().clone())
            .collect())
    }

    /// Copies every live entry of every database.
    ///
    /// The copy is only point-in-time if no writer runs concurrently; the
    /// engine takes the shared side of its global lock around this call.
    pub fn snapshot(&self) -> KeyspaceSnapshot {
        let taken_at = self.now();
        let databases: Vec<Arc<Database>> = self.databases.read().clone();

        KeyspaceSnapshot {
            taken_at,
            databases: databases
                .iter()
                .map(|database| {
                    database
                        .entries
                        .iter()
                        .filter(|item| !item.value().is_expired(taken_at))
                        .map(|item| (item.key().clone(), item.value().clone()))
                        .collect()
                })
                .collect(),
        }
    }

    /// Replaces the whole dataset with `snapshot`.
    ///
    /// Used when loading from disk, so it neither evicts nor notifies.
    /// Databases beyond the configured count are rejected before anything
    /// is touched.
    pub fn restore(&self, snapshot: KeyspaceSnapshot) -> Result<(), KeyspaceError> {
        let count = self.database_count();
        if snapshot.databases.len() > count
            && snapshot.databases[count..].iter().any(|db| !db.is_empty())
        {
            return Err(KeyspaceError::DatabaseOutOfRange {
                index: snapshot.databases.len() - 1,
                count,
            });
        }

        let now = self.now();
        let mut fresh: Vec<Arc<Database>> =
            (0..count).map(|_| Arc::new(Database::default())).collect();

        for (index, entries) in snapshot.databases.into_iter().enumerate().take(count) {
            let database = &fresh[index];
            for (key, mut entry) in entries {
                if entry.is_expired(now) {
                    continue;
                }
                entry.touch(now);
                database.add_memory(entry.estimated_size(&key));
                database.entries.insert(key, entry);
            }
        }

        std::mem::swap(&mut *self.databases.write(), &mut fresh);
        Ok(())
    }

    /// Scans every database once and removes all expired entries.
    /// Returns how many were removed.
    pub fn active_expire(&self) -> usize {
        let now = self.now();
        let databases: Vec<Arc<Database>> = self.databases.read().clone();
        let mut removed = 0;

        for (db, database) in databases.iter().enumerate() {
            let expired: Vec<Bytes> = database
                .entries
                .iter()
                .filter(|item| item.value().is_expired(now))
                .map(|item| item.key().clone())
                .collect();

            for key in expired {
                if self.expire_key(db, database, &key, now) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "active expiry sweep");
        }

        removed
    }

    /// Estimated bytes held by all databases.
    pub fn used_memory(&self) -> usize {
        self.databases
            .read()
            .iter()
            .map(|database| database.used_memory.load(Ordering::Relaxed))
            .sum()
    }

    pub fn stats(&self) -> KeyspaceStatsSnapshot {
        KeyspaceStatsSnapshot {
            keyspace_hits: self.stats.hits.load(Ordering::Relaxed),
            keyspace_misses: self.stats.misses.load(Ordering::Relaxed),
            expired_keys: self.stats.expired.load(Ordering::Relaxed),
            evicted_keys: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}
