//! Cross-process mutual exclusion for one table file.
//!
//! The lock is a sibling file `<table>.lock` created with `create_new`, which
//! is atomic on every local filesystem. Contenders poll until it disappears or
//! the bound elapses. The holder writes its pid into the file; a lock whose
//! holder is no longer running (killed mid-write, forced exit) is moved aside
//! and removed by the next contender.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::process::pid_alive;

/// Bounded spin-wait parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after waiting this long
    pub timeout: Duration,
    /// Sleep between attempts
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Held lock on a table file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock path guarding `target`.
    pub fn path_for(target: &Path) -> PathBuf {
        suffixed(target, ".lock")
    }

    /// Create the lock file exclusively, waiting up to `options.timeout`.
    pub fn acquire(target: &Path, options: &LockOptions) -> StoreResult<Self> {
        let path = Self::path_for(target);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let reclaimed = match Holder::inspect(&path) {
                        Some(holder) if holder.is_stale(options) => holder.break_lock(&path)?,
                        _ => false,
                    };
                    if reclaimed {
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= options.timeout {
                        warn!(lock = %path.display(), ?waited, "lock acquisition timed out");
                        return Err(StoreError::LockTimeout { path, waited });
                    }
                    thread::sleep(options.poll_interval);
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Distinguishes concurrent breakers within one process.
static BREAK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Snapshot of an existing lock file.
#[derive(Debug)]
struct Holder {
    /// Absent while the holder has not written it yet
    pid: Option<u32>,
    inode: u64,
    modified: Option<SystemTime>,
}

impl Holder {
    /// `None` if the lock file is gone.
    fn inspect(path: &Path) -> Option<Self> {
        let mut file = File::open(path).ok()?;
        let meta = file.metadata().ok()?;
        let mut contents = String::new();
        let _ = file.read_to_string(&mut contents);
        Some(Self {
            pid: contents.trim().parse().ok(),
            inode: meta.ino(),
            modified: meta.modified().ok(),
        })
    }

    /// A recorded holder that is no longer running. A lock without a pid
    /// is only stale once it is older than the wait bound.
    fn is_stale(&self, options: &LockOptions) -> bool {
        match self.pid {
            Some(pid) => pid != std::process::id() && !pid_alive(pid),
            None => self
                .modified
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > options.timeout),
        }
    }

    /// Move the inspected lock aside and delete it.
    ///
    /// Returns `false` if another contender got there first. If the file at
    /// `path` was replaced by a fresh holder since inspection, it is linked
    /// back in place.
    fn break_lock(&self, path: &Path) -> StoreResult<bool> {
        let seq = BREAK_SEQ.fetch_add(1, Ordering::Relaxed);
        let aside = suffixed(path, &format!(".stale.{}.{seq}", std::process::id()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::io(path, e)),
        }

        let same = fs::metadata(&aside).is_ok_and(|m| m.ino() == self.inode);
        if same {
            warn!(
                lock = %path.display(),
                holder = ?self.pid,
                "removed stale lock left by a process that is gone"
            );
        } else if let Err(e) = fs::hard_link(&aside, path) {
            warn!(lock = %path.display(), error = %e, "failed to restore a live lock");
        }
        if let Err(e) = fs::remove_file(&aside) {
            debug!(path = %aside.display(), error = %e, "failed to remove moved lock file");
        }
        Ok(same)
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(lock = %self.path.display(), "lock file already gone on release");
            }
            Err(e) => warn!(lock = %self.path.display(), error = %e, "failed to release lock"),
        }
    }
}
