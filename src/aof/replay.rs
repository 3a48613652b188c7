use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{info, warn};

use super::LogError;
use crate::resp::decode_command;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Outcome of replaying a log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Commands handed to the apply function.
    pub applied: usize,
    /// Whether replay stopped at an incomplete or malformed trailing record.
    pub truncated: bool,
    /// Length of the prefix made of complete records.
    pub valid_len: u64,
}

/// Decodes `path` one command at a time and hands each to `apply`.
///
/// Replay stops at end of file or at the first record that is incomplete or
/// not a RESP array of bulk strings. Both mean "the log ends here", usually
/// after an unclean shutdown, and are reported through
/// [`ReplayReport::truncated`] rather than as an error. A missing file
/// replays nothing.
pub fn replay_file(
    path: impl AsRef<Path>,
    mut apply: impl FnMut(Vec<Bytes>),
) -> Result<ReplayReport, LogError> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplayReport::default()),
        Err(e) => return Err(e.into()),
    };

    let mut report = ReplayReport::default();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut eof = false;

    loop {
        match decode_command(&buffer) {
            Ok(Some((args, consumed))) => {
                buffer.advance(consumed);
                report.valid_len += consumed as u64;
                if !args.is_empty() {
                    apply(args);
                    report.applied += 1;
                }
                continue;
            }
            Ok(None) if eof => {
                report.truncated = !buffer.is_empty();
                break;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, path = %path.display(), "stopping replay at malformed record");
                report.truncated = true;
                break;
            }
        }

        let read = file.read(&mut chunk)?;
        if read == 0 {
            eof = true;
        } else {
            buffer.extend_from_slice(&chunk[..read]);
        }
    }

    if report.truncated {
        warn!(
            path = %path.display(),
            dropped_bytes = buffer.len(),
            "durable log ends with an incomplete record"
        );
    }
    info!(path = %path.display(), applied = report.applied, "replayed durable log");

    Ok(report)
}
