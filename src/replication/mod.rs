//! Replication plumbing owned by the core: the backlog ring, the set of
//! connected followers, and the partial-versus-full resync decision.

mod backlog;
mod followers;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

use crate::resp::RespValue;

pub use backlog::ReplicationBacklog;
pub use followers::{FollowerId, FollowerRegistry};

const REPLICATION_ID_LENGTH: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PsyncError {
    #[error("wrong number of arguments for 'psync' command")]
    WrongArity,
    #[error("invalid PSYNC offset")]
    InvalidOffset,
}

/// Generates a fresh 40 character alphanumeric replication id.
pub fn generate_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REPLICATION_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Parsed `PSYNC <replication-id> <offset>` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncRequest {
    /// `None` when the follower sent `?` (it knows no history).
    pub replication_id: Option<String>,
    /// `None` when the follower sent `-1`.
    pub offset: Option<u64>,
}

impl PsyncRequest {
    /// Parses and validates PSYNC arguments.
    ///
    /// # Arguments
    ///
    /// * `arguments` - `[replication_id, offset]`, e.g. `["?", "-1"]` for a
    ///   first synchronization
    ///
    /// # Returns
    ///
    /// * `Ok(PsyncRequest)` - Successfully parsed arguments
    /// * `Err(PsyncError::WrongArity)` - If not exactly 2 arguments
    /// * `Err(PsyncError::InvalidOffset)` - If offset is neither `-1` nor a
    ///   non-negative integer
    pub fn parse(arguments: &[Bytes]) -> Result<Self, PsyncError> {
        let [replication_id, offset] = arguments else {
            return Err(PsyncError::WrongArity);
        };

        let replication_id = match &replication_id[..] {
            b"?" => None,
            id => Some(String::from_utf8_lossy(id).into_owned()),
        };

        let offset = match std::str::from_utf8(offset)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
        {
            Some(-1) => None,
            Some(offset) if offset >= 0 => Some(offset as u64),
            _ => return Err(PsyncError::InvalidOffset),
        };

        Ok(Self {
            replication_id,
            offset,
        })
    }
}

/// What the leader answers to a PSYNC.
#[derive(Debug, Clone, PartialEq)]
pub enum PsyncOutcome {
    /// `+CONTINUE`: the follower only needs `delta`, the bytes it missed.
    Continue { replication_id: String, delta: Bytes },
    /// `+FULLRESYNC <id> <offset>`: the follower loads `snapshot`, then
    /// receives every command after `offset` through its channel.
    FullResync {
        replication_id: String,
        offset: u64,
        snapshot: Bytes,
    },
}

impl PsyncOutcome {
    /// The status line sent before any payload.
    pub fn header(&self) -> RespValue {
        match self {
            PsyncOutcome::Continue { replication_id, .. } => {
                RespValue::SimpleString(format!("CONTINUE {}", replication_id))
            }
            PsyncOutcome::FullResync {
                replication_id,
                offset,
                ..
            } => RespValue::SimpleString(format!("FULLRESYNC {} {}", replication_id, offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<Bytes> {
        values
            .iter()
            .map(|value| Bytes::copy_from_slice(value.as_bytes()))
            .collect()
    }

    #[test]
    fn test_parse_psync() {
        let test_cases = vec![
            (
                vec!["?", "-1"],
                Ok(PsyncRequest {
                    replication_id: None,
                    offset: None,
                }),
            ),
            (
                vec!["8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb", "1024"],
                Ok(PsyncRequest {
                    replication_id: Some("8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb".into()),
                    offset: Some(1024),
                }),
            ),
            (vec!["?"], Err(PsyncError::WrongArity)),
            (vec!["?", "abc"], Err(PsyncError::InvalidOffset)),
            (vec!["?", "-5"], Err(PsyncError::InvalidOffset)),
        ];

        for (input, expected) in test_cases {
            assert_eq!(PsyncRequest::parse(&args(&input)), expected, "{:?}", input);
        }
    }

    #[test]
    fn test_replication_id_shape() {
        let id = generate_replication_id();
        assert_eq!(id.len(), REPLICATION_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_replication_id());
    }

    #[test]
    fn test_outcome_headers() {
        let full = PsyncOutcome::FullResync {
            replication_id: "abc".into(),
            offset: 7,
            snapshot: Bytes::new(),
        };
        assert_eq!(&full.header().encode()[..], b"+FULLRESYNC abc 7\r\n");

        let partial = PsyncOutcome::Continue {
            replication_id: "abc".into(),
            delta: Bytes::new(),
        };
        assert_eq!(&partial.header().encode()[..], b"+CONTINUE abc\r\n");
    }
}
