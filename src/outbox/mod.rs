//! Durable outbox for calls to the central authority.
//!
//! Pending calls live in [`JsonFileStore`] until they are delivered or run
//! out of retries, at which point they move to the [`FailedArchive`].

pub mod archive;
pub mod record;
pub mod store;

pub use archive::FailedArchive;
pub use record::{PendingRequest, DEFAULT_MAX_RETRIES};
pub use store::{JsonFileStore, OutboxStore};
