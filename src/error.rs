use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum MiddlemanError {
    #[error("Invalid branch node name: {0}")]
    InvalidTenantName(String),

    #[error("Branch node not found: {0}")]
    TenantNotFound(String),

    #[error("Failed to provision store for {tenant}: {reason}")]
    Provisioning { tenant: String, reason: String },

    #[error("Failed to connect to store for {tenant}: {reason}")]
    Connection { tenant: String, reason: String },

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Cache key not found: {0}")]
    CacheMiss(String),

    #[error("Cache key expired: {0}")]
    CacheExpired(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Outbox error: {0}")]
    Outbox(String),

    #[error("Remote returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Remote resource not found")]
    RemoteNotFound,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MiddlemanError>;

impl From<std::io::Error> for MiddlemanError {
    fn from(e: std::io::Error) -> Self {
        MiddlemanError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MiddlemanError {
    fn from(e: serde_json::Error) -> Self {
        MiddlemanError::Json(e.to_string())
    }
}

impl From<heed::Error> for MiddlemanError {
    fn from(e: heed::Error) -> Self {
        MiddlemanError::Cache(e.to_string())
    }
}

impl From<tokio_postgres::Error> for MiddlemanError {
    fn from(e: tokio_postgres::Error) -> Self {
        MiddlemanError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for MiddlemanError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        MiddlemanError::Database(e.to_string())
    }
}

impl MiddlemanError {
    /// True for both an absent and an expired cache key.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MiddlemanError::CacheMiss(_) | MiddlemanError::CacheExpired(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            MiddlemanError::InvalidTenantName(_) => StatusCode::BAD_REQUEST,
            MiddlemanError::TenantNotFound(_) => StatusCode::BAD_REQUEST,
            MiddlemanError::Provisioning { .. } => StatusCode::BAD_REQUEST,
            MiddlemanError::Connection { .. } => StatusCode::BAD_REQUEST,
            MiddlemanError::Registration(_) => StatusCode::BAD_REQUEST,
            MiddlemanError::CacheMiss(_) => StatusCode::NOT_FOUND,
            MiddlemanError::CacheExpired(_) => StatusCode::NOT_FOUND,
            MiddlemanError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlemanError::Outbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlemanError::Remote { .. } => StatusCode::BAD_GATEWAY,
            MiddlemanError::RemoteNotFound => StatusCode::NOT_FOUND,
            MiddlemanError::Transport(_) => StatusCode::BAD_GATEWAY,
            MiddlemanError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlemanError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MiddlemanError::Json(_) => StatusCode::BAD_REQUEST,
            MiddlemanError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code carried in JSON error bodies. Branch-node resolution
    /// failures keep the 4000x codes that branch agents already match on.
    pub fn error_code(&self) -> u32 {
        match self {
            MiddlemanError::InvalidTenantName(_) | MiddlemanError::TenantNotFound(_) => 40002,
            MiddlemanError::Provisioning { .. } | MiddlemanError::Connection { .. } => 40001,
            MiddlemanError::Registration(_) => 40003,
            other => u32::from(other.status_code().as_u16()) * 100,
        }
    }
}

// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u32,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for MiddlemanError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.error_code(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
