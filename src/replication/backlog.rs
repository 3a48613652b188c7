//! The replication backlog: the last `capacity` bytes of the replication
//! stream, kept so a reconnecting follower can resume by offset.

use bytes::Bytes;
use parking_lot::RwLock;

#[derive(Debug)]
struct Ring {
    buffer: Box<[u8]>,
    /// Total bytes ever written; the next byte lands at `offset % capacity`.
    offset: u64,
}

/// Fixed-capacity circular buffer of the replication stream, addressed by
/// a global offset that counts every byte ever written.
///
/// The byte at global offset `o` can be read while
/// `offset - capacity <= o <= offset`; anything older has been overwritten.
#[derive(Debug)]
pub struct ReplicationBacklog {
    capacity: usize,
    ring: RwLock<Ring>,
}

impl ReplicationBacklog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: RwLock::new(Ring {
                buffer: vec![0; capacity].into_boxed_slice(),
                offset: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Global offset just past the last byte written.
    pub fn offset(&self) -> u64 {
        self.ring.read().offset
    }

    /// Appends `data`, overwriting the oldest bytes once the ring is full.
    pub fn write(&self, data: &[u8]) {
        let mut ring = self.ring.write();
        let capacity = self.capacity;

        // Only the trailing `capacity` bytes of an oversized write survive.
        let skipped = data.len().saturating_sub(capacity);
        let tail = &data[skipped..];
        let start = ((ring.offset + skipped as u64) % capacity as u64) as usize;

        let first = tail.len().min(capacity - start);
        ring.buffer[start..start + first].copy_from_slice(&tail[..first]);
        ring.buffer[..tail.len() - first].copy_from_slice(&tail[first..]);

        ring.offset += data.len() as u64;
    }

    pub fn is_valid_offset(&self, offset: u64) -> bool {
        let current = self.offset();
        offset <= current && offset >= current.saturating_sub(self.capacity as u64)
    }

    /// Up to `limit` bytes starting at global `offset`, or `None` when that
    /// offset is no longer (or not yet) in the buffer.
    ///
    /// Reading at the current offset yields an empty buffer.
    pub fn read_from(&self, offset: u64, limit: usize) -> Option<Bytes> {
        let ring = self.ring.read();
        let current = ring.offset;

        if offset > current || offset < current.saturating_sub(self.capacity as u64) {
            return None;
        }

        let available = (current - offset) as usize;
        let length = available.min(limit);
        let start = (offset % self.capacity as u64) as usize;

        let first = length.min(self.capacity - start);
        let mut out = Vec::with_capacity(length);
        out.extend_from_slice(&ring.buffer[start..start + first]);
        out.extend_from_slice(&ring.buffer[..length - first]);

        Some(Bytes::from(out))
    }
}
