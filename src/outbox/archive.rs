use super::record::PendingRequest;
use crate::error::{MiddlemanError, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Permanent resting place for requests that ran out of retries. Nothing
/// reads these back automatically; they are kept for manual inspection.
pub struct FailedArchive {
    dir: PathBuf,
}

impl FailedArchive {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            MiddlemanError::Outbox(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(FailedArchive {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `request` to the archive. A request whose id is already
    /// archived is not written again; the existing file is returned.
    pub fn archive(&self, request: &PendingRequest) -> Result<PathBuf> {
        if let Some(existing) = self.find(request)? {
            tracing::debug!(
                "[OUTBOX] {} already archived at {}",
                request.id,
                existing.display()
            );
            return Ok(existing);
        }

        let path = self.dir.join(request.archive_file_name(Utc::now()));
        let data = serde_json::to_vec_pretty(request)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                MiddlemanError::Outbox(format!("failed to create {}: {}", path.display(), e))
            })?;
        let written: std::io::Result<()> = (|| {
            file.write_all(&data)?;
            file.write_all(b"\n")?;
            file.sync_all()
        })();
        if let Err(e) = written {
            drop(file);
            if let Err(rm) = fs::remove_file(&path) {
                tracing::error!(
                    "[OUTBOX] failed to remove partial {}: {}",
                    path.display(),
                    rm
                );
            }
            return Err(MiddlemanError::Outbox(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }

        tracing::warn!(
            "[OUTBOX] archived {} {} after {} attempts: {}",
            request.method,
            request.url,
            request.max_retries,
            path.display()
        );
        Ok(path)
    }

    fn find(&self, request: &PendingRequest) -> Result<Option<PathBuf>> {
        let suffix = format!("_{}.json", request.id);
        Ok(fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .map(|e| e.path()))
    }

    /// Number of archived records currently on disk.
    pub fn count(&self) -> Result<usize> {
        Ok(fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .count())
    }
}
