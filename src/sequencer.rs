//! The single ordered write path.
//!
//! Every mutation runs under the exclusive side of one [`GlobalLock`]. While
//! the lock is held the serialized command goes to the replication backlog,
//! then the durable log, then every follower, so all three observe writes in
//! the order the keyspace applied them.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::error;

use crate::aof::{select_command, DurableLog};
use crate::replication::{FollowerId, FollowerRegistry, ReplicationBacklog};

/// The process-wide write lock. Mutations take it exclusively, reads take
/// it shared; the data itself lives elsewhere.
pub type GlobalLock = RwLock<()>;

#[derive(Debug)]
pub struct WriteSequencer {
    lock: Arc<GlobalLock>,
    backlog: Arc<ReplicationBacklog>,
    log: Option<Arc<DurableLog>>,
    followers: Arc<FollowerRegistry>,
    /// Database the replication stream last selected. Only touched while
    /// the write lock is held.
    stream_db: Mutex<Option<usize>>,
}

impl WriteSequencer {
    /// # Arguments
    ///
    /// * `lock` - The lock shared with every reader of the keyspace
    /// * `log` - `None` when append-only persistence is off
    pub fn new(
        lock: Arc<GlobalLock>,
        backlog: Arc<ReplicationBacklog>,
        log: Option<Arc<DurableLog>>,
        followers: Arc<FollowerRegistry>,
    ) -> Self {
        Self {
            lock,
            backlog,
            log,
            followers,
            stream_db: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> &Arc<GlobalLock> {
        &self.lock
    }

    /// Runs `mutation` and propagates `command` as one atomic step.
    ///
    /// # Arguments
    ///
    /// * `db` - Database the command applies to
    /// * `mutation` - Applies the change to the keyspace
    /// * `command` - The RESP-encoded command, as produced by
    ///   [`crate::resp::encode_command`]
    ///
    /// # Examples
    ///
    /// ```ignore
    /// sequencer.execute_write(
    ///     0,
    ///     || keyspace.put(0, key.clone(), Entry::new(value)),
    ///     encode_command(["SET", "fruit", "mango"]),
    /// )?;
    /// ```
    pub fn execute_write<R>(&self, db: usize, mutation: impl FnOnce() -> R, command: Bytes) -> R {
        let _guard = self.lock.write();
        let result = mutation();
        self.propagate(db, &command);
        result
    }

    /// Like [`WriteSequencer::execute_write`], but nothing is propagated
    /// when `mutation` fails.
    pub fn try_execute_write<R, E>(
        &self,
        db: usize,
        mutation: impl FnOnce() -> Result<R, E>,
        command: Bytes,
    ) -> Result<R, E> {
        let _guard = self.lock.write();
        let result = mutation()?;
        self.propagate(db, &command);
        Ok(result)
    }

    /// Runs a read-only operation under the shared lock.
    pub fn read<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.read();
        f()
    }

    /// Runs `f` with the current replication offset and registers a new
    /// follower in the same critical section, so the follower's stream
    /// starts with exactly the first write `f` did not observe.
    pub fn register_follower<R>(
        &self,
        f: impl FnOnce(u64) -> R,
    ) -> (R, FollowerId, UnboundedReceiver<Bytes>) {
        let _guard = self.lock.write();
        let result = f(self.backlog.offset());

        // The follower starts from database 0; force a SELECT on the next write.
        *self.stream_db.lock() = None;
        let (id, receiver) = self.followers.register();

        (result, id, receiver)
    }

    /// Caller must hold the write lock.
    fn propagate(&self, db: usize, command: &Bytes) {
        {
            let mut stream_db = self.stream_db.lock();
            if *stream_db != Some(db) {
                let select = select_command(db);
                self.backlog.write(&select);
                self.followers.forward(&select);
                *stream_db = Some(db);
            }
        }

        self.backlog.write(command);

        if let Some(log) = &self.log {
            if let Err(e) = log.append(db, command) {
                error!(error = %e, db, "durable log append failed; write kept in memory");
            }
        }

        self.followers.forward(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::encode_command;

    fn new_sequencer(
        log: Option<Arc<DurableLog>>,
    ) -> (WriteSequencer, Arc<ReplicationBacklog>, Arc<FollowerRegistry>) {
        let backlog = Arc::new(ReplicationBacklog::new(4096));
        let followers = Arc::new(FollowerRegistry::new());
        let sequencer = WriteSequencer::new(
            Arc::new(GlobalLock::new(())),
            Arc::clone(&backlog),
            log,
            Arc::clone(&followers),
        );
        (sequencer, backlog, followers)
    }

    #[test]
    fn test_execute_write_runs_mutation_then_propagates() {
        let (sequencer, backlog, _) = new_sequencer(None);
        let command = encode_command(["SET", "a", "1"]);

        let result = sequencer.execute_write(0, || 42, command.clone());

        assert_eq!(result, 42);
        let select = select_command(0);
        let mut expected = select.to_vec();
        expected.extend_from_slice(&command);
        assert_eq!(backlog.read_from(0, usize::MAX).unwrap(), Bytes::from(expected));
    }

    #[test]
    fn test_failed_mutation_is_not_propagated() {
        let (sequencer, backlog, _) = new_sequencer(None);

        let result: Result<(), &str> =
            sequencer.try_execute_write(0, || Err("wrong type"), encode_command(["SET", "a", "1"]));

        assert_eq!(result, Err("wrong type"));
        assert_eq!(backlog.offset(), 0);
    }

    #[test]
    fn test_select_only_on_database_change() {
        let (sequencer, backlog, _) = new_sequencer(None);
        let first = encode_command(["SET", "a", "1"]);
        let second = encode_command(["SET", "b", "2"]);
        let third = encode_command(["SET", "c", "3"]);

        sequencer.execute_write(0, || (), first.clone());
        sequencer.execute_write(0, || (), second.clone());
        sequencer.execute_write(3, || (), third.clone());

        let mut expected = Vec::new();
        expected.extend_from_slice(&select_command(0));
        expected.extend_from_slice(&first);
        expected.extend_from_slice(&second);
        expected.extend_from_slice(&select_command(3));
        expected.extend_from_slice(&third);

        assert_eq!(&backlog.read_from(0, usize::MAX).unwrap()[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_registered_follower_stream_starts_after_offset() {
        let (sequencer, _, followers) = new_sequencer(None);
        sequencer.execute_write(2, || (), encode_command(["SET", "before", "1"]));

        let (offset, id, mut receiver) = sequencer.register_follower(|offset| offset);
        assert!(offset > 0);
        assert_eq!(followers.len(), 1);

        let after = encode_command(["SET", "after", "1"]);
        sequencer.execute_write(2, || (), after.clone());

        // Same database as before, but the new follower still gets a SELECT.
        assert_eq!(receiver.recv().await.unwrap(), select_command(2));
        assert_eq!(receiver.recv().await.unwrap(), after);
        assert!(followers.remove(id));
    }

    #[test]
    fn test_read_runs_under_shared_lock() {
        let (sequencer, _, _) = new_sequencer(None);
        let _shared = sequencer.lock().read();
        assert_eq!(sequencer.read(|| "ok"), "ok");
        assert!(sequencer.lock().try_write().is_none());
    }
}
