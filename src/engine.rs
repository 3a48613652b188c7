//! The composed engine: one keyspace, its durable log, the replication
//! backlog and follower set, and the sequencer that orders writes across
//! all of them. Built once at startup and shared by handle.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aof::{replay_file, ApplyError, ApplyFallback, DurableLog, LogApplier, LogError};
use crate::config::{ConfigError, EngineConfig};
use crate::keyspace::{Keyspace, KeyspaceError, KeyspaceEvent, KeyspaceListener};
use crate::rdb::{read_snapshot_file, write_snapshot_file, RdbEncoder, RdbParser, SnapshotError};
use crate::replication::{
    generate_replication_id, FollowerId, FollowerRegistry, PsyncOutcome, PsyncRequest,
    ReplicationBacklog,
};
use crate::sequencer::{GlobalLock, WriteSequencer};
use crate::time::{Clock, SystemClock};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("append-only persistence is disabled")]
    AppendOnlyDisabled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where the dataset came from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Empty,
    DurableLog { applied: usize, skipped: usize, truncated: bool },
    Snapshot { keys: usize },
}

/// A follower accepted by [`Engine::psync`].
#[derive(Debug)]
pub struct FollowerSession {
    pub id: FollowerId,
    pub outcome: PsyncOutcome,
    /// Every command written after the outcome was decided.
    pub stream: UnboundedReceiver<Bytes>,
}

/// Appends a `DEL` to the durable log for every evicted key.
struct EvictionLogger {
    log: Option<Arc<DurableLog>>,
}

impl KeyspaceListener for EvictionLogger {
    fn on_event(&self, db: usize, key: &Bytes, event: KeyspaceEvent) {
        if event != KeyspaceEvent::Evicted {
            return;
        }

        debug!(db, key = %String::from_utf8_lossy(key), "key evicted");

        if let Some(log) = &self.log {
            if let Err(e) = log.log(db, &[&b"DEL"[..], &key[..]]) {
                error!(error = %e, db, "failed to log eviction");
            }
        }
    }
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    keyspace: Arc<Keyspace>,
    log: Option<Arc<DurableLog>>,
    backlog: Arc<ReplicationBacklog>,
    followers: Arc<FollowerRegistry>,
    sequencer: WriteSequencer,
    replication_id: String,
    load_source: LoadSource,
}

impl Engine {
    /// Opens the engine with the system clock.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Builds every component and loads the dataset.
    ///
    /// With append-only persistence on and a log file present, the log is
    /// replayed. Otherwise the snapshot file is loaded if there is one; when
    /// the log is on but was missing, it is then rewritten from the loaded
    /// data so it is complete on its own.
    pub fn open_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        Self::open_with_replay(config, clock, None)
    }

    /// Like [`Engine::open_with_clock`], but every logged command outside
    /// the built-in replay vocabulary is handed to `replay_fallback`.
    ///
    /// Command handlers that log commands such as `INCR` or `LPOP` install
    /// one to re-execute them at startup; without it those records are
    /// skipped.
    pub fn open_with_replay(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        replay_fallback: Option<ApplyFallback<'_>>,
    ) -> Result<Self, EngineError> {
        let keyspace = Arc::new(Keyspace::new(config.databases, clock));
        keyspace.set_max_memory(config.max_memory);
        keyspace.set_eviction_policy(config.eviction_policy);

        let append_path = config.append_path();
        let load_source = if config.append_only && append_path.exists() {
            replay_log(&keyspace, &append_path, replay_fallback)?
        } else {
            load_snapshot(&keyspace, &config)?
        };

        let log = if config.append_only {
            let log = Arc::new(DurableLog::open(&append_path)?);
            if matches!(load_source, LoadSource::Snapshot { .. }) {
                log.rewrite(&keyspace.snapshot())?;
            }
            Some(log)
        } else {
            None
        };

        keyspace.set_listener(Arc::new(EvictionLogger { log: log.clone() }));

        let backlog = Arc::new(ReplicationBacklog::new(config.backlog_size));
        let followers = Arc::new(FollowerRegistry::new());
        let sequencer = WriteSequencer::new(
            Arc::new(GlobalLock::new(())),
            Arc::clone(&backlog),
            log.clone(),
            Arc::clone(&followers),
        );

        let replication_id = generate_replication_id();
        info!(
            databases = config.databases,
            append_only = config.append_only,
            replication_id = %replication_id,
            source = ?load_source,
            "engine ready"
        );

        Ok(Self {
            config,
            keyspace,
            log,
            backlog,
            followers,
            sequencer,
            replication_id,
            load_source,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn log(&self) -> Option<&Arc<DurableLog>> {
        self.log.as_ref()
    }

    pub fn backlog(&self) -> &Arc<ReplicationBacklog> {
        &self.backlog
    }

    pub fn followers(&self) -> &Arc<FollowerRegistry> {
        &self.followers
    }

    pub fn sequencer(&self) -> &WriteSequencer {
        &self.sequencer
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    /// See [`WriteSequencer::execute_write`].
    pub fn execute_write<R>(
        &self,
        db: usize,
        mutation: impl FnOnce(&Keyspace) -> R,
        command: Bytes,
    ) -> R {
        self.sequencer
            .execute_write(db, || mutation(&self.keyspace), command)
    }

    /// See [`WriteSequencer::try_execute_write`].
    pub fn try_execute_write<R, E>(
        &self,
        db: usize,
        mutation: impl FnOnce(&Keyspace) -> Result<R, E>,
        command: Bytes,
    ) -> Result<R, E> {
        self.sequencer
            .try_execute_write(db, || mutation(&self.keyspace), command)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Keyspace) -> R) -> R {
        self.sequencer.read(|| f(&self.keyspace))
    }

    /// Answers a follower's PSYNC and registers it.
    ///
    /// The follower gets a `Continue` with the bytes it missed when it names
    /// this engine's replication id and an offset still in the backlog;
    /// otherwise a `FullResync` with an encoded snapshot. Either way the
    /// decision, the payload and the registration happen under the write
    /// lock, so the returned stream continues exactly where the payload ends.
    pub fn psync(&self, request: &PsyncRequest) -> FollowerSession {
        let encoder = RdbEncoder::new(self.config.rdb_compression);

        let (outcome, id, stream) = self.sequencer.register_follower(|offset| {
            let delta = match (&request.replication_id, request.offset) {
                (Some(id), Some(requested)) if *id == self.replication_id => {
                    self.backlog.read_from(requested, usize::MAX)
                }
                _ => None,
            };

            match delta {
                Some(delta) => PsyncOutcome::Continue {
                    replication_id: self.replication_id.clone(),
                    delta,
                },
                None => PsyncOutcome::FullResync {
                    replication_id: self.replication_id.clone(),
                    offset,
                    snapshot: encoder.encode(&self.keyspace.snapshot()),
                },
            }
        });

        info!(
            follower = id,
            partial = matches!(outcome, PsyncOutcome::Continue { .. }),
            "follower synchronized"
        );

        FollowerSession {
            id,
            outcome,
            stream,
        }
    }

    /// Compacts the durable log while writes continue.
    ///
    /// The rewrite is marked and the keyspace copied under the shared lock,
    /// so no write can fall between the two; the file work happens after the
    /// lock is released.
    pub fn rewrite_log(&self) -> Result<(), EngineError> {
        let log = self.log.as_ref().ok_or(EngineError::AppendOnlyDisabled)?;

        let snapshot = self.sequencer.read(|| -> Result<_, LogError> {
            log.begin_rewrite()?;
            Ok(self.keyspace.snapshot())
        })?;

        log.finish_rewrite(&snapshot)?;
        Ok(())
    }

    /// Writes a snapshot of the current dataset to the configured file.
    /// Returns the number of keys saved.
    pub fn save_snapshot(&self) -> Result<usize, EngineError> {
        let snapshot = self.sequencer.read(|| self.keyspace.snapshot());
        let bytes = RdbEncoder::new(self.config.rdb_compression).encode(&snapshot);

        write_snapshot_file(&self.config.snapshot_path(), &bytes)?;
        Ok(snapshot.key_count())
    }

    /// Starts the log flusher and the active expiration sweep.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut handles = Vec::new();

        if let Some(log) = &self.log {
            handles.push(log.spawn_flusher(self.config.flush_interval));
        }

        handles.push(spawn_active_expiry(
            Arc::clone(&self.keyspace),
            self.config.active_expire_interval,
        ));

        BackgroundTasks { handles }
    }

    /// Flushes the durable log.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        if let Some(log) = &self.log {
            log.flush()?;
        }
        info!("engine shut down");
        Ok(())
    }
}

/// Handles to the engine's periodic tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn spawn_active_expiry(keyspace: Arc<Keyspace>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let keyspace = Arc::clone(&keyspace);
            match tokio::task::spawn_blocking(move || keyspace.active_expire()).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "active expiration sweep"),
                Err(e) => error!(error = %e, "active expiration task failed"),
            }
        }
    })
}

fn replay_log(
    keyspace: &Keyspace,
    path: &std::path::Path,
    fallback: Option<ApplyFallback<'_>>,
) -> Result<LoadSource, EngineError> {
    let mut applier = LogApplier::new(keyspace);
    if let Some(fallback) = fallback {
        applier = applier.with_fallback(fallback);
    }
    let mut skipped = 0;

    let report = replay_file(path, |command| {
        if let Err(e) = applier.apply(&command) {
            skipped += 1;
            let name = command.first().cloned().unwrap_or_default();
            warn!(error = %e, command = %String::from_utf8_lossy(&name), "skipped log record");
        }
    })?;

    if report.truncated {
        // New records must not land after the partial one.
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(report.valid_len)?;
        warn!(
            path = %path.display(),
            valid_len = report.valid_len,
            "truncated incomplete tail of durable log"
        );
    }
    info!(
        path = %path.display(),
        applied = report.applied - skipped,
        skipped,
        "replayed durable log"
    );

    Ok(LoadSource::DurableLog {
        applied: report.applied - skipped,
        skipped,
        truncated: report.truncated,
    })
}

fn load_snapshot(keyspace: &Keyspace, config: &EngineConfig) -> Result<LoadSource, EngineError> {
    let path = config.snapshot_path();
    let Some(bytes) = read_snapshot_file(&path)? else {
        return Ok(LoadSource::Empty);
    };

    let snapshot = RdbParser::new(config.databases, keyspace.now()).parse(&bytes)?;
    let keys = snapshot.key_count();
    keyspace.restore(snapshot)?;

    info!(path = %path.display(), keys, "loaded snapshot");
    Ok(LoadSource::Snapshot { keys })
}
