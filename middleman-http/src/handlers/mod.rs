use middleman::tenant::{NodeDirectory, PgProvisioner, StoreProvisioner};
use middleman::{ExpiringCache, TenantRegistry};
use middleman_sync::{GatewayConfig, RetryManager};
use std::sync::Arc;

pub mod health;
pub mod nodes;
pub mod outbox;
pub mod tenant;

/// Handles shared by every request. Built once in `serve()` and passed to
/// the router; nothing here is process-global.
pub struct AppState<P: StoreProvisioner = PgProvisioner> {
    pub config: GatewayConfig,
    pub registry: Arc<TenantRegistry<P>>,
    pub directory: Arc<dyn NodeDirectory>,
    pub cache: Arc<ExpiringCache>,
    pub retryer: Arc<RetryManager>,
}

pub use health::health;
pub use nodes::{list_slaves, register};
pub use outbox::{drain_outbox, outbox_status};
pub use tenant::current_tenant;
