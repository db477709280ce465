use crate::error::{MiddlemanError, Result};
use crate::types::TenantName;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Creates and connects to the isolated backing store of one tenant.
#[async_trait]
pub trait StoreProvisioner: Send + Sync + 'static {
    /// Pooled connection handle shared by every caller for a tenant.
    type Handle: Clone + Send + Sync + 'static;

    /// Create the tenant's store if it does not exist yet. Must be idempotent.
    async fn ensure_store(&self, tenant: &TenantName) -> Result<()>;

    /// Open a pooled handle to an existing store.
    async fn connect(&self, tenant: &TenantName) -> Result<Self::Handle>;

    /// Create the tenant's tables. Runs once per handle.
    async fn init_schema(&self, tenant: &TenantName, handle: &Self::Handle) -> Result<()>;
}

/// Maps tenant names to live store handles, provisioning each store lazily
/// and at most once per process.
pub struct TenantRegistry<P: StoreProvisioner> {
    provisioner: P,
    stores: RwLock<HashMap<TenantName, P::Handle>>,
}

impl<P: StoreProvisioner> TenantRegistry<P> {
    pub fn new(provisioner: P) -> Self {
        TenantRegistry {
            provisioner,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry and provision the default tenant immediately.
    /// Callers treat an error here as fatal: nothing can be served without
    /// the default store.
    pub async fn bootstrap(provisioner: P) -> Result<Arc<Self>> {
        let registry = Arc::new(Self::new(provisioner));
        registry.resolve(&TenantName::default_tenant()).await?;
        Ok(registry)
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Return the handle for `tenant`, provisioning its store on first use.
    ///
    /// Failures leave the registry untouched, so the next call retries
    /// provisioning from scratch.
    pub async fn resolve(&self, tenant: &TenantName) -> Result<P::Handle> {
        if let Some(handle) = self.stores.read().await.get(tenant) {
            return Ok(handle.clone());
        }

        let mut stores = self.stores.write().await;
        // Another caller may have provisioned it while we waited for the lock.
        if let Some(handle) = stores.get(tenant) {
            return Ok(handle.clone());
        }

        tracing::info!("[TENANT {}] provisioning store", tenant);

        self.provisioner
            .ensure_store(tenant)
            .await
            .map_err(|e| provisioning_error(tenant, e))?;

        let handle = self
            .provisioner
            .connect(tenant)
            .await
            .map_err(|e| connection_error(tenant, e))?;

        self.provisioner
            .init_schema(tenant, &handle)
            .await
            .map_err(|e| connection_error(tenant, e))?;

        stores.insert(tenant.clone(), handle.clone());
        tracing::info!("[TENANT {}] store ready", tenant);
        Ok(handle)
    }

    pub async fn default_store(&self) -> Result<P::Handle> {
        self.resolve(&TenantName::default_tenant()).await
    }

    pub async fn is_loaded(&self, tenant: &TenantName) -> bool {
        self.stores.read().await.contains_key(tenant)
    }

    /// Names of tenants with a live handle, sorted.
    pub async fn loaded(&self) -> Vec<TenantName> {
        let mut names: Vec<_> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn provisioning_error(tenant: &TenantName, e: MiddlemanError) -> MiddlemanError {
    match e {
        MiddlemanError::Provisioning { .. } => e,
        other => MiddlemanError::Provisioning {
            tenant: tenant.to_string(),
            reason: other.to_string(),
        },
    }
}

fn connection_error(tenant: &TenantName, e: MiddlemanError) -> MiddlemanError {
    match e {
        MiddlemanError::Connection { .. } => e,
        other => MiddlemanError::Connection {
            tenant: tenant.to_string(),
            reason: other.to_string(),
        },
    }
}
