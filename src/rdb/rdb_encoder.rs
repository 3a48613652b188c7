use bytes::{BufMut, Bytes, BytesMut};

use crate::key_value_store::{Entry, Value};
use crate::keyspace::KeyspaceSnapshot;
use crate::rdb::{
    encoding::{write_length, write_string},
    opcode::{
        value_type_of, write_text_score, AUX_OPCODE, DATABASE_OPCODE, END_OF_FILE_OPCODE,
        EXPIRATION_MILLISECONDS_OPCODE, MAGIC_STRING, RESIZE_DB_OPCODE, WRITTEN_VERSION,
    },
};

const REDIS_VERSION: &str = "7.2.0";

/// Serializes a [`KeyspaceSnapshot`] into RDB bytes.
#[derive(Debug, Clone, Copy)]
pub struct RdbEncoder {
    compression: bool,
}

impl Default for RdbEncoder {
    fn default() -> Self {
        Self { compression: true }
    }
}

impl RdbEncoder {
    /// # Arguments
    ///
    /// * `compression` - LZF-compress long strings when it saves space
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    /// Encodes every database that holds at least one live entry.
    ///
    /// Entries already expired at `snapshot.taken_at` are skipped. The
    /// checksum trailer is written as zero, meaning "not computed".
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let bytes = RdbEncoder::new(true).encode(&keyspace.snapshot());
    /// assert!(bytes.starts_with(b"REDIS0009"));
    /// ```
    pub fn encode(&self, snapshot: &KeyspaceSnapshot) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        out.put_slice(MAGIC_STRING);
        out.put_slice(WRITTEN_VERSION.as_bytes());

        self.write_aux(&mut out, "redis-ver", REDIS_VERSION);
        self.write_aux(&mut out, "redis-bits", &(usize::BITS).to_string());
        self.write_aux(&mut out, "ctime", &(snapshot.taken_at / 1000).to_string());

        for (index, entries) in snapshot.databases.iter().enumerate() {
            let live: Vec<&(Bytes, Entry)> = entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(snapshot.taken_at))
                .collect();
            if live.is_empty() {
                continue;
            }

            out.put_u8(DATABASE_OPCODE);
            write_length(&mut out, index);
            out.put_u8(RESIZE_DB_OPCODE);
            write_length(&mut out, live.len());
            write_length(
                &mut out,
                live.iter().filter(|(_, entry)| entry.expires_at.is_some()).count(),
            );

            for (key, entry) in live {
                if let Some(expires_at) = entry.expires_at {
                    out.put_u8(EXPIRATION_MILLISECONDS_OPCODE);
                    out.put_u64_le(expires_at);
                }
                out.put_u8(value_type_of(entry.value()));
                write_string(&mut out, key, self.compression);
                self.write_value(&mut out, entry.value());
            }
        }

        out.put_u8(END_OF_FILE_OPCODE);
        out.put_u64(0);
        out.freeze()
    }

    fn write_aux(&self, out: &mut BytesMut, key: &str, value: &str) {
        out.put_u8(AUX_OPCODE);
        write_string(out, key.as_bytes(), false);
        write_string(out, value.as_bytes(), false);
    }

    fn write_value(&self, out: &mut BytesMut, value: &Value) {
        match value {
            Value::String(bytes) => write_string(out, bytes, self.compression),
            Value::List(list) => {
                write_length(out, list.len());
                for item in list {
                    write_string(out, item, self.compression);
                }
            }
            Value::Set(set) => {
                write_length(out, set.len());
                for member in set {
                    write_string(out, member, self.compression);
                }
            }
            Value::Hash(map) => {
                write_length(out, map.len());
                for (field, value) in map {
                    write_string(out, field, self.compression);
                    write_string(out, value, self.compression);
                }
            }
            Value::SortedSet(zset) => {
                write_length(out, zset.len());
                for (member, score) in zset.iter() {
                    write_string(out, member, self.compression);
                    write_text_score(out, score);
                }
            }
        }
    }
}
