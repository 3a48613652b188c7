use bytes::Bytes;
use tracing::debug;

use crate::key_value_store::Entry;
use crate::keyspace::KeyspaceSnapshot;
use crate::rdb::{
    opcode::{parse_magic_string, parse_opcode, OpCodeResponse},
    SnapshotError,
};

/// Decodes a complete snapshot into a [`KeyspaceSnapshot`].
///
/// The whole input is decoded before anything is returned, so a corrupt
/// file never yields a partial dataset.
#[derive(Debug, Clone, Copy)]
pub struct RdbParser {
    database_count: usize,
    now: u64,
}

impl RdbParser {
    /// # Arguments
    ///
    /// * `database_count` - Number of logical databases; a snapshot that
    ///   selects a database at or beyond it is rejected
    /// * `now` - Current time in epoch milliseconds; entries that expired
    ///   before it are dropped
    pub fn new(database_count: usize, now: u64) -> Self {
        Self {
            database_count,
            now,
        }
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<KeyspaceSnapshot, SnapshotError> {
        let header = parse_magic_string(bytes)?;
        let mut cursor = header.number_of_read_bytes;

        let mut databases: Vec<Vec<(Bytes, Entry)>> = vec![Vec::new(); self.database_count];
        let mut current_db = 0;
        let mut pending_expiration: Option<u64> = None;
        let mut dropped = 0usize;

        loop {
            let (response, bytes_read) = parse_opcode(bytes, cursor)?;
            cursor += bytes_read;

            if pending_expiration.is_some()
                && !matches!(response, OpCodeResponse::KeyValuePair { .. })
            {
                return Err(SnapshotError::DanglingExpiration);
            }

            match response {
                OpCodeResponse::Aux { key, value } => {
                    debug!(
                        key = %String::from_utf8_lossy(&key),
                        value = %String::from_utf8_lossy(&value),
                        "snapshot aux field"
                    );
                }
                OpCodeResponse::ResizeDb { db_size, .. } => {
                    if let Some(database) = databases.get_mut(current_db) {
                        database.reserve(db_size.min(bytes.len()));
                    }
                }
                OpCodeResponse::Database { index } => {
                    if index >= self.database_count {
                        return Err(SnapshotError::DatabaseOutOfRange {
                            index,
                            count: self.database_count,
                        });
                    }
                    current_db = index;
                }
                OpCodeResponse::Expiration { expires_at } => {
                    pending_expiration = Some(expires_at);
                }
                OpCodeResponse::KeyValuePair { key, value } => {
                    let expires_at = pending_expiration.take();
                    if expires_at.map_or(false, |at| at < self.now) {
                        dropped += 1;
                        continue;
                    }

                    let database = databases.get_mut(current_db).ok_or(
                        SnapshotError::DatabaseOutOfRange {
                            index: current_db,
                            count: self.database_count,
                        },
                    )?;
                    database.push((key, Entry::with_expiry(value, expires_at)));
                }
                OpCodeResponse::EndOfFile { .. } => break,
            }
        }

        debug!(
            version = header.version,
            dropped_expired = dropped,
            "decoded snapshot"
        );

        Ok(KeyspaceSnapshot {
            taken_at: self.now,
            databases,
        })
    }
}
