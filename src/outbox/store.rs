use super::record::PendingRequest;
use crate::error::{MiddlemanError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Persistence for pending outbound calls. Whatever is in the store is, by
/// definition, still pending.
pub trait OutboxStore: Send + Sync {
    /// Persist `request`, overwriting any earlier copy with the same id.
    fn save(&self, request: &PendingRequest) -> Result<()>;

    /// Load every pending request. Unreadable records are skipped.
    fn load_all(&self) -> Result<Vec<PendingRequest>>;

    /// Remove `request`. Removing an absent request succeeds.
    fn delete(&self, request: &PendingRequest) -> Result<()>;
}

/// One pretty-printed JSON file per request, named `{id}.json`. A record
/// loaded from a file with another name keeps living in that file.
pub struct JsonFileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            MiddlemanError::Outbox(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(JsonFileStore {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, request: &PendingRequest) -> PathBuf {
        match &request.path {
            Some(path) => path.clone(),
            None => self.dir.join(request.file_name()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutboxStore for JsonFileStore {
    fn save(&self, request: &PendingRequest) -> Result<()> {
        let _guard = self.guard();

        let path = self.path_for(request);
        let data = serde_json::to_vec_pretty(request)?;

        // Write-then-rename so a crash never leaves a half-written record
        // under its final name.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                MiddlemanError::Outbox(format!("failed to save {}: {}", path.display(), e))
            })?;

        tracing::debug!("[OUTBOX] saved {} to {}", request.id, path.display());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PendingRequest>> {
        let _guard = self.guard();

        let mut entries: Vec<_> = fs::read_dir(&self.dir)
            .map_err(|e| {
                MiddlemanError::Outbox(format!("failed to read {}: {}", self.dir.display(), e))
            })?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut requests = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = entry.path();
            let data = match fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!("[OUTBOX] failed to read {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<PendingRequest>(&data) {
                Ok(mut request) => {
                    request.path = Some(path);
                    requests.push(request);
                }
                Err(e) => {
                    tracing::error!("[OUTBOX] skipping unparsable {}: {}", path.display(), e);
                }
            }
        }

        tracing::debug!("[OUTBOX] loaded {} pending requests", requests.len());
        Ok(requests)
    }

    fn delete(&self, request: &PendingRequest) -> Result<()> {
        let _guard = self.guard();

        let path = self.path_for(request);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("[OUTBOX] deleted {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("[OUTBOX] {} already absent", path.display());
                Ok(())
            }
            Err(e) => Err(MiddlemanError::Outbox(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
