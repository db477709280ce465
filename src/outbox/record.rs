use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Retry budget applied to newly enqueued requests.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// One outbound call that has not yet been confirmed by the authority.
///
/// The body is kept as the exact serialized bytes the caller produced, so
/// the outbox can persist and replay a call without knowing its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: String,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_times: Vec<DateTime<Utc>>,
    /// Where the record was loaded from; filled in by the store, never persisted.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl PendingRequest {
    pub fn new(
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Option<String>,
        max_retries: u32,
        cause: &str,
    ) -> Self {
        let now = Utc::now();
        PendingRequest {
            id: Uuid::new_v4(),
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            body,
            headers,
            retry_count: 0,
            max_retries,
            last_error: cause.to_string(),
            first_attempt: now,
            last_attempt: now,
            attempt_times: vec![now],
            path: None,
        }
    }

    /// Record a failed replay. The counter never moves past `max_retries`
    /// on its own and never moves backwards.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
        self.last_error = error.into();
        self.last_attempt = now;
        self.attempt_times.push(now);
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// `{YYYYmmdd_HHMMSS}_{METHOD}_{url-fragment}_{id}.json`
    pub fn archive_file_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}_{}.json",
            at.format("%Y%m%d_%H%M%S"),
            self.method,
            url_fragment(&self.url),
            self.id
        )
    }
}

/// Last non-empty path segment of a URL, without query string, reduced to
/// characters that are safe in a file name.
fn url_fragment(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    let segment = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}
