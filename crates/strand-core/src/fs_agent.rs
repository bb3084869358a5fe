use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::quota::ResourceQuota;
use crate::{Error, Result};

/// Owns the log directory and the size quota seeded from it.
///
/// Initialization is fatal when the directory cannot be created or written:
/// a log unit that cannot persist must not come up.
#[derive(Debug)]
pub struct FileSystemAgent {
    log_dir: PathBuf,
    quota: Arc<ResourceQuota>,
}

impl FileSystemAgent {
    /// Create the log directory if needed, verify it is writable, and seed
    /// the quota with the size of existing segment files.
    pub fn init(log_dir: &Path, size_limit: Option<u64>) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| Error::LogUnit(format!("cannot create log directory {}: {e}", log_dir.display())))?;

        let probe = log_dir.join(".writable");
        std::fs::write(&probe, b"")
            .and_then(|()| std::fs::remove_file(&probe))
            .map_err(|e| Error::LogUnit(format!("log directory {} is not writable: {e}", log_dir.display())))?;

        let quota = Arc::new(ResourceQuota::new(size_limit));
        let initial = segment_bytes_on_disk(log_dir)?;
        quota.acquire(initial);

        info!(dir = %log_dir.display(), used_bytes = initial, "initialized log directory");
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            quota,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn quota(&self) -> Arc<ResourceQuota> {
        self.quota.clone()
    }
}

/// Sum of segment file sizes in the directory. Non-segment files are not
/// counted against the quota.
fn segment_bytes_on_disk(log_dir: &Path) -> Result<u64> {
    let mut total = 0;
    for dir_entry in std::fs::read_dir(log_dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if path.extension().is_some_and(|ext| ext == "log") {
            total += dir_entry.metadata()?.len();
        }
    }
    Ok(total)
}
