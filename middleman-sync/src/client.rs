use super::manager::{truncate, RetryManager, MAX_ERROR_BODY};
use super::types::Delivery;
use middleman::{BranchNode, MiddlemanError, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PROTOCOL_VERSION: &str = "1.0";

/// HTTP client for the central authority a branch node mirrors into.
///
/// The plain verbs report failures to the caller. [`AuthorityClient::mirror`]
/// never loses a mutation: anything the authority does not confirm is
/// written to the outbox and replayed later by the retry worker.
pub struct AuthorityClient {
    endpoint: String,
    token: String,
    http: reqwest::Client,
    retryer: Arc<RetryManager>,
    last_success: AtomicU64, // Unix timestamp in seconds
}

impl AuthorityClient {
    pub fn new(endpoint: &str, token: &str, retryer: Arc<RetryManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(retryer.policy().request_timeout)
            .build()
            .map_err(|e| MiddlemanError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(AuthorityClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            retryer,
            last_success: AtomicU64::new(0),
        })
    }

    pub fn for_node(node: &BranchNode, retryer: Arc<RetryManager>) -> Result<Self> {
        Self::new(&node.endpoint, &node.private_token, retryer)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Token {}", self.token));
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Middleman-Version".to_string(), PROTOCOL_VERSION.to_string());
        headers
    }

    fn mark_success(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_success.store(now, Ordering::Relaxed);
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut builder = self.http.request(method, url);
        for (name, value) in self.headers() {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder.send().await
    }

    /// Send and require one of `accept`; the response body is returned as text.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        accept: fn(StatusCode) -> bool,
    ) -> Result<String> {
        let url = self.url(path);
        let response = self
            .send(method.clone(), &url, body)
            .await
            .map_err(|e| MiddlemanError::Transport(format!("{} {}: {}", method, url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MiddlemanError::Transport(format!("read response from {}: {}", url, e)))?;

        if accept(status) {
            self.mark_success();
            return Ok(text);
        }
        if status == StatusCode::NOT_FOUND && method == Method::DELETE {
            return Err(MiddlemanError::RemoteNotFound);
        }
        Err(MiddlemanError::Remote {
            status: status.as_u16(),
            body: truncate(&text, MAX_ERROR_BODY).to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let text = self
            .call(Method::GET, path, None, |s| s.is_success())
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Create a resource. Only `201 Created` counts as success.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_string(body)?;
        let text = self
            .call(Method::POST, path, Some(body), |s| s == StatusCode::CREATED)
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_string(body)?;
        self.call(Method::PATCH, path, Some(body), |s| s.is_success())
            .await
            .map(|_| ())
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_string(body)?;
        self.call(Method::PUT, path, Some(body), |s| s.is_success())
            .await
            .map(|_| ())
    }

    /// Delete a resource. A 404 comes back as [`MiddlemanError::RemoteNotFound`].
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.call(Method::DELETE, path, None, |s| s.is_success())
            .await
            .map(|_| ())
    }

    /// Mirror a local mutation to the authority.
    ///
    /// Any 2xx is `Delivered` and a 404 is `AlreadyAbsent`. Every other
    /// outcome, transport errors included, is queued in the outbox with the
    /// exact serialized body. An `Err` means the mutation could not even be
    /// queued.
    pub async fn mirror<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Delivery> {
        let body = body.map(serde_json::to_string).transpose()?;
        let url = self.url(path);

        let cause = match self.send(method.clone(), &url, body.clone()).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    self.mark_success();
                    return Ok(Delivery::Delivered);
                }
                if status == StatusCode::NOT_FOUND {
                    tracing::debug!("[SYNC] {} {} already absent upstream", method, url);
                    return Ok(Delivery::AlreadyAbsent);
                }
                let text = response.text().await.unwrap_or_default();
                format!(
                    "request error: {} - {}",
                    status.as_u16(),
                    truncate(&text, MAX_ERROR_BODY)
                )
            }
            Err(e) => format!("send request failed: {}", e),
        };

        tracing::warn!("[SYNC] {} {} not confirmed: {}", method, url, cause);
        let id = self
            .retryer
            .enqueue(method.as_str(), &url, self.headers(), body, &cause)?;
        Ok(Delivery::Queued(id))
    }
}
