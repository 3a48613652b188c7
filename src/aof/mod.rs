//! The durable log: an append-only file of RESP-encoded commands.
//!
//! Appends go through a buffered writer that a background task flushes on a
//! fixed interval. Compaction ("rewrite") runs while writers keep appending:
//!
//! ```text
//! Idle --begin_rewrite--> Rewriting --finish_rewrite--> Swapping --> Idle
//! ```
//!
//! While `Rewriting`, every appended record is also copied into a side
//! buffer. `finish_rewrite` writes the reconstruction of a keyspace snapshot
//! to a temporary file without holding the log's lock, then enters
//! `Swapping`: the side buffer is drained into the temporary file, which is
//! renamed over the live file and reopened for appending. Failure at any
//! point returns to `Idle` and leaves the live file untouched.

mod apply;
mod replay;
mod rewrite;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::keyspace::KeyspaceSnapshot;
use crate::resp::encode_command;

pub use apply::{ApplyError, ApplyFallback, LogApplier};
pub use replay::{replay_file, ReplayReport};
pub use rewrite::{reconstruction_commands, write_reconstruction};

#[derive(Error, Debug)]
pub enum LogError {
    #[error("durable log I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("a log rewrite is already in progress")]
    RewriteInProgress,
    #[error("no log rewrite has been started")]
    NotRewriting,
}

/// Where the log is in its compaction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteState {
    Idle,
    Rewriting,
    Swapping,
}

#[derive(Debug)]
struct LogState {
    writer: BufWriter<File>,
    /// Database the last record in the live file applies to.
    selected_db: Option<usize>,
    rewrite: RewriteState,
    side_buffer: BytesMut,
}

#[derive(Debug)]
pub struct DurableLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl DurableLog {
    /// Opens (creating if needed) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(open_append(&path)?);

        debug!(path = %path.display(), "opened durable log");

        Ok(Self {
            path,
            state: Mutex::new(LogState {
                writer,
                selected_db: None,
                rewrite: RewriteState::Idle,
                side_buffer: BytesMut::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rewrite_state(&self) -> RewriteState {
        self.state.lock().rewrite
    }

    /// Serializes `args` (command name first) and appends it for `db`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// log.log(0, &["SET", "fruit", "mango"])?;
    /// ```
    pub fn log<A: AsRef<[u8]>>(&self, db: usize, args: &[A]) -> Result<(), LogError> {
        self.append(db, &encode_command(args))
    }

    /// Appends one pre-serialized record for `db`, preceded by a `SELECT`
    /// when the previous record targeted another database.
    pub fn append(&self, db: usize, record: &[u8]) -> Result<(), LogError> {
        let mut state = self.state.lock();

        if state.selected_db != Some(db) {
            let select = select_command(db);
            state.write_record(&select)?;
            state.selected_db = Some(db);
        }

        state.write_record(record)
    }

    /// Pushes buffered records to the OS and syncs file data to disk.
    pub fn flush(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flushes every `interval` on a tokio task until aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let log = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let log = Arc::clone(&log);
                match tokio::task::spawn_blocking(move || log.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "failed to flush durable log"),
                    Err(e) => error!(error = %e, "durable log flush task failed"),
                }
            }
        })
    }

    /// Enters `Rewriting` with an empty side buffer.
    ///
    /// The caller must take its keyspace snapshot before any further write
    /// can be appended, so that every write is either in the snapshot or in
    /// the side buffer and never in both.
    pub fn begin_rewrite(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();

        if state.rewrite != RewriteState::Idle {
            return Err(LogError::RewriteInProgress);
        }

        state.rewrite = RewriteState::Rewriting;
        state.side_buffer.clear();
        // The rewritten file ends in whatever database the snapshot walk
        // selected last, so the next appended record must select explicitly.
        state.selected_db = None;
        Ok(())
    }

    /// Writes the reconstruction of `snapshot`, appends everything logged
    /// since [`DurableLog::begin_rewrite`], and swaps the result in.
    pub fn finish_rewrite(&self, snapshot: &KeyspaceSnapshot) -> Result<(), LogError> {
        if self.rewrite_state() != RewriteState::Rewriting {
            return Err(LogError::NotRewriting);
        }

        let temp_path = self.temp_path();

        let result = self.write_and_swap(&temp_path, snapshot);

        if let Err(e) = &result {
            let mut state = self.state.lock();
            state.rewrite = RewriteState::Idle;
            state.side_buffer.clear();
            drop(state);

            if let Err(remove_error) = fs::remove_file(&temp_path) {
                if remove_error.kind() != io::ErrorKind::NotFound {
                    warn!(error = %remove_error, "failed to remove temporary rewrite file");
                }
            }
            error!(error = %e, path = %self.path.display(), "durable log rewrite failed");
        }

        result
    }

    /// Compacts the log down to the reconstruction of `snapshot`.
    ///
    /// Only safe when no write can happen between the moment `snapshot` was
    /// taken and this call; the engine uses the two-step API instead.
    pub fn rewrite(&self, snapshot: &KeyspaceSnapshot) -> Result<(), LogError> {
        self.begin_rewrite()?;
        self.finish_rewrite(snapshot)
    }

    fn write_and_swap(&self, temp_path: &Path, snapshot: &KeyspaceSnapshot) -> Result<(), LogError> {
        let mut temp = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(temp_path)?,
        );
        let commands = write_reconstruction(&mut temp, snapshot)?;

        let mut state = self.state.lock();
        state.rewrite = RewriteState::Swapping;

        let pending = state.side_buffer.split().freeze();
        temp.write_all(&pending)?;
        temp.flush()?;
        temp.get_ref().sync_all()?;
        drop(temp);

        state.writer.flush()?;
        state.writer = BufWriter::new(swap_in(temp_path, &self.path)?);
        state.rewrite = RewriteState::Idle;

        info!(
            path = %self.path.display(),
            commands,
            concurrent_bytes = pending.len(),
            "durable log rewrite finished"
        );

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Reads the live log from the beginning, handing each command to `apply`.
    pub fn replay(&self, apply: impl FnMut(Vec<Bytes>)) -> Result<ReplayReport, LogError> {
        replay_file(&self.path, apply)
    }
}

impl LogState {
    fn write_record(&mut self, record: &[u8]) -> Result<(), LogError> {
        if self.rewrite == RewriteState::Rewriting {
            self.side_buffer.extend_from_slice(record);
        }
        self.writer.write_all(record)?;
        Ok(())
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        if let Err(e) = self.state.get_mut().writer.flush() {
            error!(error = %e, "failed to flush durable log on close");
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Opens `temp_path` for appending, then renames it over `path`. The handle
/// follows the file through the rename; if the open fails `path` is left
/// as it was.
fn swap_in(temp_path: &Path, path: &Path) -> io::Result<File> {
    let file = open_append(temp_path)?;
    fs::rename(temp_path, path)?;
    Ok(file)
}

pub(crate) fn select_command(db: usize) -> Bytes {
    encode_command(["SELECT".as_bytes(), db.to_string().as_bytes()])
}
