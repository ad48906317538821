//! Whole-table JSON reads and atomic replacement writes.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Read a table, treating a missing, unreadable or corrupt file as empty.
///
/// Corrupt bytes are copied to `<file>.corrupt` before the next write
/// replaces them, and the event is logged at `warn`.
pub(crate) fn read_table<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!(table = %path.display(), error = %e, "table unreadable, treating as empty");
            return T::default();
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }

    match serde_json::from_slice(&bytes) {
        Ok(table) => table,
        Err(e) => {
            let quarantine = corrupt_path(path);
            warn!(
                table = %path.display(),
                quarantine = %quarantine.display(),
                error = %e,
                "table corrupt, treating as empty"
            );
            if let Err(e) = fs::write(&quarantine, &bytes) {
                warn!(path = %quarantine.display(), error = %e, "failed to keep corrupt table copy");
            }
            T::default()
        }
    }
}

/// Serialize `table` to a temp file in the same directory, fsync it, and
/// rename it over `path`.
pub(crate) fn write_table<T: Serialize>(path: &Path, table: &T) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;

    serde_json::to_writer_pretty(&mut tmp, table)?;
    tmp.write_all(b"\n").map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
