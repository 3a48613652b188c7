use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::rdb::SnapshotError;

/// Writes `bytes` to `<path>.tmp`, syncs it and renames it over `path`,
/// so a crash mid-write never leaves a torn snapshot behind.
pub fn write_snapshot_file(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let temp_path = temp_path(path);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        if let Err(remove_error) = fs::remove_file(&temp_path) {
            if remove_error.kind() != io::ErrorKind::NotFound {
                warn!(
                    error = %remove_error,
                    path = %temp_path.display(),
                    "failed to remove temporary snapshot file"
                );
            }
        }
        return Err(e.into());
    }

    info!(path = %path.display(), bytes = bytes.len(), "snapshot saved");
    Ok(())
}

/// Reads a snapshot file; a missing file is `Ok(None)`.
pub fn read_snapshot_file(path: &Path) -> Result<Option<Vec<u8>>, SnapshotError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        assert!(read_snapshot_file(&path).unwrap().is_none());

        write_snapshot_file(&path, b"REDIS0009first").unwrap();
        write_snapshot_file(&path, b"REDIS0009second").unwrap();

        assert_eq!(read_snapshot_file(&path).unwrap().unwrap(), b"REDIS0009second");
        assert!(!dir.path().join("dump.rdb.tmp").exists());
    }

    #[test]
    fn test_failed_write_leaves_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        write_snapshot_file(&path, b"original").unwrap();

        // A directory where the temporary file should go makes the write fail.
        fs::create_dir(dir.path().join("dump.rdb.tmp")).unwrap();
        assert!(write_snapshot_file(&path, b"replacement").is_err());

        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(dir.path().join("dump.rdb.tmp").is_dir());
    }

    #[test]
    fn test_failed_rename_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target makes the rename fail.
        let path = dir.path().join("dump.rdb");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        assert!(write_snapshot_file(&path, b"REDIS0009").is_err());
        assert!(!dir.path().join("dump.rdb.tmp").exists());
    }
}
