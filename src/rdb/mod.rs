//! RDB snapshot codec.
//!
//! A snapshot file is laid out as:
//!
//! ```text
//! "REDIS" <4 digit version>
//! (AUX <key> <value>)*
//! (SELECTDB <n> RESIZEDB <size> <expires>
//!     ([EXPIRETIME_MS <u64 le>] <type> <key> <value>)*)*
//! EOF <8 byte checksum>
//! ```
//!
//! The parser reads every format Redis has produced up to version 12,
//! including the compact ziplist, zipmap, intset and listpack containers
//! and LZF compressed strings. The encoder writes version 9 with the plain
//! container types, which every reader understands.

mod compact;
mod encoding;
mod get_slice;
pub mod lzf;
mod opcode;
mod rdb_encoder;
mod rdb_file_operations;
mod rdb_parser;

use thiserror::Error;

pub use rdb_encoder::RdbEncoder;
pub use rdb_file_operations::{read_snapshot_file, write_snapshot_file};
pub use rdb_parser::RdbParser;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("invalid magic string")]
    InvalidMagic,
    #[error("unsupported RDB version: {0}")]
    UnsupportedVersion(String),
    #[error("unexpected end of snapshot at byte {cursor} (needed {needed} more)")]
    UnexpectedEof { cursor: usize, needed: usize },
    #[error("invalid length encoding 0x{0:02X}")]
    InvalidLengthEncoding(u8),
    #[error("unknown string encoding {0}")]
    UnknownStringEncoding(u8),
    #[error("unsupported value type {0}")]
    UnsupportedType(u8),
    #[error("invalid LZF data: {0}")]
    InvalidLzf(&'static str),
    #[error("invalid {container} encoding: {reason}")]
    InvalidCompactEncoding {
        container: &'static str,
        reason: String,
    },
    #[error("invalid sorted set score")]
    InvalidScore,
    #[error("database index {index} out of range (0..{count})")]
    DatabaseOutOfRange { index: usize, count: usize },
    #[error("expiration not followed by a key")]
    DanglingExpiration,
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    fn compact(container: &'static str, reason: impl Into<String>) -> Self {
        SnapshotError::InvalidCompactEncoding {
            container,
            reason: reason.into(),
        }
    }
}
