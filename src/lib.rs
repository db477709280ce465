//! # Middleman
//!
//! Core of a multi-tenant synchronization gateway. Each branch node (tenant)
//! owns an isolated backing store, and every mutation made against it is
//! mirrored to one central authority over HTTP.
//!
//! This crate holds the pieces with real invariants:
//!
//! - [`TenantRegistry`]: resolves a tenant name to a pooled store handle,
//!   creating the store at most once even under concurrent first access.
//! - [`outbox`]: the durable store of outbound calls that have not been
//!   confirmed yet, plus the archive of calls that ran out of retries.
//! - [`ExpiringCache`]: a persistent key/value store with optional TTL,
//!   used to remember where a resource's remote counterpart lives.
//!
//! Replay of the outbox and the HTTP client live in `middleman-sync`; the
//! axum surface lives in `middleman-http`.
//!
//! ```rust,no_run
//! use middleman::outbox::{JsonFileStore, OutboxStore, PendingRequest};
//! use std::collections::BTreeMap;
//!
//! # fn main() -> middleman::Result<()> {
//! let store = JsonFileStore::open(std::path::Path::new("./data/retry_storage"))?;
//! let req = PendingRequest::new(
//!     "POST",
//!     "https://authority.example.com/api/v1/users/",
//!     BTreeMap::new(),
//!     Some(r#"{"username":"alice"}"#.to_string()),
//!     10,
//!     "connection refused",
//! );
//! store.save(&req)?;
//! assert_eq!(store.load_all()?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod outbox;
pub mod tenant;
pub mod types;

pub use cache::ExpiringCache;
pub use error::{MiddlemanError, Result};
pub use tenant::{PgRegistry, TenantRegistry};
pub use types::*;
