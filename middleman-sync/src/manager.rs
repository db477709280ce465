use super::config::RetryPolicy;
use super::types::{DrainReport, OutboxStatus};
use middleman::outbox::{FailedArchive, JsonFileStore, OutboxStore, PendingRequest};
use middleman::{MiddlemanError, Result};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const OUTBOX_DIR: &str = "retry_storage";
pub const ARCHIVE_DIR: &str = "archive_failed";

/// Longest response body kept in `last_error`.
pub(crate) const MAX_ERROR_BODY: usize = 512;

enum Attempt {
    /// 2xx, or 404 (the target is already gone upstream).
    Delivered(u16),
    Failed(String),
}

/// Owns the outbox: accepts failed calls, replays them on each drain pass
/// and archives the ones that exhaust their retry budget.
pub struct RetryManager {
    store: Arc<dyn OutboxStore>,
    archive: FailedArchive,
    http: reqwest::Client,
    policy: RetryPolicy,
    draining: AtomicBool,
}

/// Clears the in-progress flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryManager {
    /// Open the outbox under `{data_dir}/retry_storage` and the archive under
    /// `{data_dir}/archive_failed`.
    pub fn open(data_dir: &Path, policy: RetryPolicy) -> Result<Arc<Self>> {
        let store = JsonFileStore::open(&data_dir.join(OUTBOX_DIR))?;
        let archive = FailedArchive::open(&data_dir.join(ARCHIVE_DIR))?;
        Self::with_store(Arc::new(store), archive, policy)
    }

    pub fn with_store(
        store: Arc<dyn OutboxStore>,
        archive: FailedArchive,
        policy: RetryPolicy,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .map_err(|e| MiddlemanError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Arc::new(RetryManager {
            store,
            archive,
            http,
            policy,
            draining: AtomicBool::new(false),
        }))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Durably record a call that failed on its first attempt. Only touches
    /// local disk, never the network.
    pub fn enqueue(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Option<String>,
        cause: &dyn Display,
    ) -> Result<Uuid> {
        let request = PendingRequest::new(
            method,
            url,
            headers,
            body,
            self.policy.max_retries,
            &cause.to_string(),
        );
        self.store.save(&request)?;
        tracing::info!(
            "[RETRY] queued {} {} as {}: {}",
            request.method,
            request.url,
            request.id,
            request.last_error
        );
        Ok(request.id)
    }

    pub fn pending(&self) -> Result<Vec<PendingRequest>> {
        self.store.load_all()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<OutboxStatus> {
        Ok(OutboxStatus {
            pending: self.store.load_all()?.len(),
            archived: self.archive.count()?,
            draining: self.is_draining(),
            max_retries: self.policy.max_retries,
            interval_secs: self.policy.interval.as_secs(),
        })
    }

    /// Run one drain pass over every pending request.
    ///
    /// Returns `None` without doing anything if another pass is already in
    /// progress. Requests are replayed one at a time, and each outcome is
    /// persisted before the next request is attempted.
    pub async fn drain(&self) -> Option<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("[RETRY] drain already running, skipping");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        let requests = match self.store.load_all() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[RETRY] failed to load pending requests: {}", e);
                return Some(report);
            }
        };
        report.loaded = requests.len();

        for request in requests {
            tracing::info!(
                "[RETRY] replaying {} {} (attempt {})",
                request.method,
                request.url,
                request.retry_count + 1
            );
            let attempt = self.replay(&request).await;
            self.settle(request, attempt, &mut report);
        }

        if !report.is_empty() {
            tracing::info!(
                "[RETRY] pass done: loaded={} delivered={} retried={} archived={} failed_io={}",
                report.loaded,
                report.delivered,
                report.retried,
                report.archived,
                report.failed_io
            );
        }
        Some(report)
    }

    async fn replay(&self, request: &PendingRequest) -> Attempt {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return Attempt::Failed(format!("invalid method '{}'", request.method)),
        };

        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Failed(format!("send request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Attempt::Delivered(status.as_u16());
        }

        match response.text().await {
            Ok(body) => Attempt::Failed(format!(
                "request error: {} - {}",
                status.as_u16(),
                truncate(&body, MAX_ERROR_BODY)
            )),
            Err(e) => Attempt::Failed(format!(
                "request error: {} (read response failed: {})",
                status.as_u16(),
                e
            )),
        }
    }

    fn settle(&self, mut request: PendingRequest, attempt: Attempt, report: &mut DrainReport) {
        match attempt {
            Attempt::Delivered(status) => match self.store.delete(&request) {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::info!(
                        "[RETRY] delivered {} {} ({})",
                        request.method,
                        request.url,
                        status
                    );
                }
                Err(e) => {
                    report.failed_io += 1;
                    tracing::error!(
                        "[RETRY] delivered {} but failed to remove it: {}",
                        request.id,
                        e
                    );
                }
            },
            Attempt::Failed(error) => {
                request.record_failure(error);
                tracing::info!(
                    "[RETRY] {} {} failed ({}/{}): {}",
                    request.method,
                    request.url,
                    request.retry_count,
                    request.max_retries,
                    request.last_error
                );

                if request.is_exhausted() {
                    self.exhaust(&request, report);
                } else {
                    match self.store.save(&request) {
                        Ok(()) => report.retried += 1,
                        Err(e) => {
                            report.failed_io += 1;
                            tracing::error!("[RETRY] failed to persist {}: {}", request.id, e);
                        }
                    }
                }
            }
        }
    }

    /// Move an exhausted request from the outbox to the archive. If the
    /// archive write fails the request stays in the outbox.
    fn exhaust(&self, request: &PendingRequest, report: &mut DrainReport) {
        if let Err(e) = self.archive.archive(request) {
            report.failed_io += 1;
            tracing::error!("[RETRY] failed to archive {}: {}", request.id, e);
            if let Err(e) = self.store.save(request) {
                tracing::error!("[RETRY] failed to persist {}: {}", request.id, e);
            }
            return;
        }

        match self.store.delete(request) {
            Ok(()) => report.archived += 1,
            Err(e) => {
                report.failed_io += 1;
                tracing::error!(
                    "[RETRY] archived {} but failed to remove it: {}",
                    request.id,
                    e
                );
            }
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn archive_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir.join(ARCHIVE_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect()
    }

    /// An address nothing listens on.
    fn unreachable_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/api/v1/users/", port)
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_enqueue_persists_without_network() {
        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();

        let id = manager
            .enqueue(
                "POST",
                "http://authority.invalid/api/v1/users/",
                BTreeMap::new(),
                Some("{}".into()),
                &"connection refused",
            )
            .unwrap();

        let pending = manager.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].max_retries, 10);
        assert_eq!(pending[0].last_error, "connection refused");
        assert_eq!(pending[0].first_attempt, pending[0].last_attempt);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_retried_then_archived() {
        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        let url = unreachable_url();

        let id = manager
            .enqueue("POST", &url, BTreeMap::new(), Some("{}".into()), &"refused")
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let pending = manager.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].attempt_times.len(), 2);
        assert!(pending[0].last_error.contains("send request failed"));

        for _ in 1..9 {
            manager.drain().await.unwrap();
        }
        assert_eq!(manager.pending().unwrap()[0].retry_count, 9);
        assert!(archive_files(tmp.path()).is_empty());

        let report = manager.drain().await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(manager.pending().unwrap().is_empty());

        let archived = archive_files(tmp.path());
        assert_eq!(archived.len(), 1);
        assert!(archived[0].contains("_POST_users_"));
        assert!(archived[0].contains(&id.to_string()));

        // An archived request is never picked up again.
        let report = manager.drain().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(archive_files(tmp.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_success_removes_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/users/"))
            .and(header("Authorization", "Token secret"))
            .and(body_string(r#"{"username":"alice"}"#))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Token secret".to_string());
        manager
            .enqueue(
                "POST",
                &format!("{}/api/v1/users/", server.uri()),
                headers,
                Some(r#"{"username":"alice"}"#.into()),
                &"timeout",
            )
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(manager.pending().unwrap().is_empty());
        assert!(archive_files(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_not_found_counts_as_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        manager
            .enqueue(
                "DELETE",
                &format!("{}/api/v1/assets/assets/9/", server.uri()),
                BTreeMap::new(),
                None,
                &"503",
            )
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(manager.pending().unwrap().is_empty());
        assert!(archive_files(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_server_error_keeps_record_with_details() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db is down"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        manager
            .enqueue(
                "PATCH",
                &format!("{}/api/v1/users/1/", server.uri()),
                BTreeMap::new(),
                Some("{}".into()),
                &"first failure",
            )
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let pending = manager.pending().unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error, "request error: 500 - db is down");
    }

    #[tokio::test]
    async fn test_target_recovers_before_next_pass() {
        let server = MockServer::start().await;
        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        manager
            .enqueue(
                "POST",
                &format!("{}/api/v1/perms/", server.uri()),
                BTreeMap::new(),
                Some("{}".into()),
                &"refused",
            )
            .unwrap();

        // Unmatched requests get a 404 from wiremock, which counts as
        // delivered, so the outage needs an explicit 503.
        let outage = Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount_as_scoped(&server)
            .await;
        manager.drain().await.unwrap();
        assert_eq!(manager.pending().unwrap()[0].retry_count, 1);
        drop(outage);

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let report = manager.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(manager.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_are_settled_independently() {
        let server = MockServer::start().await;
        Mock::given(path("/ok/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(path("/broken/"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        for p in ["/ok/", "/broken/", "/ok/"] {
            manager
                .enqueue("PUT", &format!("{}{}", server.uri(), p), BTreeMap::new(), None, &"x")
                .unwrap();
        }

        let report = manager.drain().await.unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.retried, 1);
        let pending = manager.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].url.ends_with("/broken/"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_drain_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(10)).unwrap();
        manager
            .enqueue("POST", &format!("{}/x/", server.uri()), BTreeMap::new(), None, &"x")
            .unwrap();

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_draining());
        assert!(manager.drain().await.is_none());

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!manager.is_draining());
    }

    #[tokio::test]
    async fn test_invalid_method_exhausts_instead_of_panicking() {
        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(1)).unwrap();
        manager
            .enqueue("NOT A METHOD", "http://127.0.0.1:1/x", BTreeMap::new(), None, &"x")
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(manager.pending().unwrap().is_empty());
    }

    /// Outbox whose deletes fail until `allow_delete` is set.
    struct StuckDeleteStore {
        inner: JsonFileStore,
        allow_delete: AtomicBool,
    }

    impl OutboxStore for StuckDeleteStore {
        fn save(&self, request: &PendingRequest) -> Result<()> {
            self.inner.save(request)
        }

        fn load_all(&self) -> Result<Vec<PendingRequest>> {
            self.inner.load_all()
        }

        fn delete(&self, request: &PendingRequest) -> Result<()> {
            if !self.allow_delete.load(Ordering::SeqCst) {
                return Err(MiddlemanError::Outbox("disk is read-only".into()));
            }
            self.inner.delete(request)
        }
    }

    #[tokio::test]
    async fn test_failed_removal_after_archive_does_not_archive_twice() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(StuckDeleteStore {
            inner: JsonFileStore::open(&tmp.path().join(OUTBOX_DIR)).unwrap(),
            allow_delete: AtomicBool::new(false),
        });
        let archive = FailedArchive::open(&tmp.path().join(ARCHIVE_DIR)).unwrap();
        let manager = RetryManager::with_store(store.clone(), archive, policy(1)).unwrap();
        manager
            .enqueue("POST", &unreachable_url(), BTreeMap::new(), None, &"refused")
            .unwrap();

        let report = manager.drain().await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(report.failed_io, 1);
        assert_eq!(manager.pending().unwrap().len(), 1);
        assert_eq!(archive_files(tmp.path()).len(), 1);

        store.allow_delete.store(true, Ordering::SeqCst);
        let report = manager.drain().await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(manager.pending().unwrap().is_empty());
        assert_eq!(archive_files(tmp.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        let tmp = TempDir::new().unwrap();
        let manager = RetryManager::open(tmp.path(), policy(3)).unwrap();
        manager
            .enqueue("POST", "http://127.0.0.1:1/x", BTreeMap::new(), None, &"x")
            .unwrap();

        let status = manager.status().unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.archived, 0);
        assert!(!status.draining);
        assert_eq!(status.max_retries, 3);
    }
}
