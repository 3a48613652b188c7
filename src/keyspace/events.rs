use std::fmt;

use bytes::Bytes;

/// Something that happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyspaceEvent {
    /// A key that did not exist was written.
    New,
    /// An existing key was overwritten.
    Set,
    /// A key was removed explicitly.
    Del,
    /// A key was found past its expiration and removed.
    Expired,
    /// A key was removed to bring memory back under the ceiling.
    Evicted,
}

impl fmt::Display for KeyspaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyspaceEvent::New => "new",
            KeyspaceEvent::Set => "set",
            KeyspaceEvent::Del => "del",
            KeyspaceEvent::Expired => "expired",
            KeyspaceEvent::Evicted => "evicted",
        };
        write!(f, "{}", name)
    }
}

/// Receives keyspace notifications.
///
/// Called after the change is visible and with no map shard locked, so an
/// implementation may read the keyspace again. It runs on the thread that
/// caused the event and must not block for long.
pub trait KeyspaceListener: Send + Sync {
    fn on_event(&self, db: usize, key: &Bytes, event: KeyspaceEvent);
}
