//! Delivery of branch-node mutations to the central authority.
//!
//! [`client::AuthorityClient`] makes the first attempt. Whatever it cannot
//! deliver lands in the outbox owned by [`manager::RetryManager`], and the
//! worker from [`task::spawn_retry_worker`] drains it on a fixed interval.

pub mod client;
pub mod config;
pub mod manager;
pub mod task;
pub mod types;

pub use client::AuthorityClient;
pub use config::{GatewayConfig, RetryConfig, RetryPolicy};
pub use manager::RetryManager;
pub use task::spawn_retry_worker;
pub use types::{Delivery, DrainReport, OutboxStatus};
