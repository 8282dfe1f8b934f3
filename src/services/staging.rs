//! Local staging files for downloaded artifacts and annotated frames.
//!
//! Every [`StagedFile`] removes its file when dropped, so a job leaves nothing
//! behind on disk whichever way it exits.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing nanosecond stamp, seeded from the wall clock.
pub fn next_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut prev = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_STAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Object keys may contain '/', local file names may not.
pub fn flatten_key(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

/// Unique staging path: `{dir}/{prefix}_{stamp}_{key}{suffix}`.
pub fn staging_path(dir: &Path, prefix: &str, key: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{prefix}_{}_{}{suffix}", next_stamp(), flatten_key(key)))
}

/// A file in the staging directory owned by one job.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Take ownership of `path`; the file (if it ever exists) is removed on drop.
    pub fn adopt(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write `bytes` to `path` and take ownership of it.
    pub async fn write(path: PathBuf, bytes: &[u8]) -> io::Result<Self> {
        let staged = Self::adopt(path);
        tokio::fs::write(&staged.path, bytes).await?;
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged file")
            }
        }
    }
}
