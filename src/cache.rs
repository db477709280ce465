//! Persistent key/value cache with optional per-entry expiry.
//!
//! Backed by an LMDB environment (via `heed`). Expiry is evaluated lazily:
//! an expired entry is reported as [`MiddlemanError::CacheExpired`] and
//! removed by the read that notices it.

use crate::error::{MiddlemanError, Result};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_MAP_SIZE_MB: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: serde_json::Value,
    /// Unix seconds; 0 means the entry never expires.
    expires_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at > 0 && now > self.expires_at
    }
}

pub struct ExpiringCache {
    env: Env,
    db: Database<Str, Bytes>,
    lock: RwLock<()>,
}

impl ExpiringCache {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_size(path, DEFAULT_MAP_SIZE_MB)
    }

    pub fn open_with_size(path: &Path, max_size_mb: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment directory is owned by this process and is
        // opened at most once per path.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }?;

        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some("cache"))?;
        wtxn.commit()?;

        tracing::info!("[CACHE] opened {}", path.display());
        Ok(ExpiringCache {
            env,
            db,
            lock: RwLock::new(()),
        })
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `value` under `key`. A `ttl_secs` of 0 keeps the entry forever.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let expires_at = if ttl_secs > 0 {
            now_secs().saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
        } else {
            0
        };
        let entry = CacheEntry {
            value: serde_json::to_value(value)?,
            expires_at,
        };
        let bytes = serde_json::to_vec(&entry)?;

        let _guard = self.write_guard();
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, key, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Fetch the value under `key`.
    ///
    /// Returns [`MiddlemanError::CacheMiss`] if the key is absent and
    /// [`MiddlemanError::CacheExpired`] if it was present but stale.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let entry = {
            let _guard = self.read_guard();
            let rtxn = self.env.read_txn()?;
            match self.db.get(&rtxn, key)? {
                Some(bytes) => decode(key, bytes)?,
                None => return Err(MiddlemanError::CacheMiss(key.to_string())),
            }
        };

        if entry.is_expired(now_secs()) {
            self.expire(key)?;
            return Err(MiddlemanError::CacheExpired(key.to_string()));
        }

        serde_json::from_value(entry.value).map_err(|e| {
            MiddlemanError::Cache(format!("value under '{}' has unexpected shape: {}", key, e))
        })
    }

    /// Delete `key` if it is still expired. The staleness check is repeated
    /// inside the write transaction, so a concurrent `set` that refreshed
    /// the key is never clobbered.
    fn expire(&self, key: &str) -> Result<()> {
        let _guard = self.write_guard();
        let mut wtxn = self.env.write_txn()?;
        let still_expired = match self.db.get(&wtxn, key)? {
            Some(bytes) => decode(key, bytes)?.is_expired(now_secs()),
            None => false,
        };
        if still_expired {
            self.db.delete(&mut wtxn, key)?;
            tracing::debug!("[CACHE] evicted expired key {}", key);
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Remove `key`. Removing an absent key succeeds.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_guard();
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_guard();
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> Result<u64> {
        let _guard = self.read_guard();
        let rtxn = self.env.read_txn()?;
        Ok(self.db.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush and close the environment so the same path can be reopened.
    pub fn close(self) {
        let _ = self.env.force_sync();
        self.env.prepare_for_closing().wait();
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<CacheEntry> {
    serde_json::from_slice(bytes)
        .map_err(|e| MiddlemanError::Cache(format!("corrupt entry under '{}': {}", key, e)))
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
