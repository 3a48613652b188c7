//! Connected followers and their outgoing replication streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

pub type FollowerId = u64;

#[derive(Debug)]
struct Follower {
    sender: UnboundedSender<Bytes>,
    /// Last offset the follower acknowledged with `REPLCONF ACK`.
    acked_offset: u64,
}

/// Connected followers and the channels feeding their replication streams.
///
/// The connection task owning a follower's socket drains the receiver
/// returned by [`FollowerRegistry::register`]; this side never blocks on a
/// slow follower.
#[derive(Debug, Default)]
pub struct FollowerRegistry {
    followers: Mutex<HashMap<FollowerId, Follower>>,
    next_id: AtomicU64,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a follower whose stream starts with the next forwarded command.
    pub fn register(&self) -> (FollowerId, UnboundedReceiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.followers.lock().insert(
            id,
            Follower {
                sender,
                acked_offset: 0,
            },
        );

        debug!(follower = id, "registered follower");
        (id, receiver)
    }

    pub fn remove(&self, id: FollowerId) -> bool {
        self.followers.lock().remove(&id).is_some()
    }

    /// Sends `command` to every follower, dropping those whose receiver is
    /// gone. Returns how many followers received it.
    pub fn forward(&self, command: &Bytes) -> usize {
        let mut followers = self.followers.lock();

        followers.retain(|id, follower| match follower.sender.send(command.clone()) {
            Ok(()) => true,
            Err(_) => {
                warn!(follower = *id, "dropping disconnected follower");
                false
            }
        });

        followers.len()
    }

    /// Records the offset a follower reports as processed.
    pub fn acknowledge(&self, id: FollowerId, offset: u64) -> bool {
        match self.followers.lock().get_mut(&id) {
            Some(follower) => {
                follower.acked_offset = follower.acked_offset.max(offset);
                true
            }
            None => false,
        }
    }

    /// Number of followers that acknowledged at least `offset`.
    pub fn acknowledged_count(&self, offset: u64) -> usize {
        self.followers
            .lock()
            .values()
            .filter(|follower| follower.acked_offset >= offset)
            .count()
    }

    pub fn len(&self) -> usize {
        self.followers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
