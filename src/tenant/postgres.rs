use super::directory::DIRECTORY_SCHEMA;
use super::registry::StoreProvisioner;
use crate::error::{MiddlemanError, Result};
use crate::types::TenantName;
use async_trait::async_trait;
use deadpool_postgres::{Hook, HookError, Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

/// Handle to one tenant's database.
pub type TenantStore = Pool;

/// Connection settings shared by every tenant database on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Maintenance database used to check for and create tenant databases.
    pub admin_db: String,
    pub max_open: usize,
    pub max_lifetime_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            admin_db: "postgres".to_string(),
            max_open: 100,
            max_lifetime_secs: 3600,
            connect_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    /// Apply `MIDDLEMAN_DB_*` overrides from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MIDDLEMAN_DB_HOST") {
            self.host = v;
        }
        if let Some(v) = std::env::var("MIDDLEMAN_DB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.port = v;
        }
        if let Ok(v) = std::env::var("MIDDLEMAN_DB_USER") {
            self.user = v;
        }
        if let Ok(v) = std::env::var("MIDDLEMAN_DB_PWD") {
            self.password = v;
        }
        self
    }

    fn pg_config(&self, dbname: &str) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .password(&self.password)
            .dbname(dbname)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        cfg
    }
}

/// Provisions one Postgres database per tenant on a shared server.
pub struct PgProvisioner {
    config: StoreConfig,
    tenant_schema: Vec<String>,
}

impl PgProvisioner {
    pub fn new(config: StoreConfig) -> Self {
        PgProvisioner {
            config,
            tenant_schema: Vec::new(),
        }
    }

    /// DDL run once against every non-default tenant database.
    pub fn with_tenant_schema(mut self, statements: Vec<String>) -> Self {
        self.tenant_schema = statements;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[async_trait]
impl StoreProvisioner for PgProvisioner {
    type Handle = TenantStore;

    async fn ensure_store(&self, tenant: &TenantName) -> Result<()> {
        let provisioning = |reason: String| MiddlemanError::Provisioning {
            tenant: tenant.to_string(),
            reason,
        };

        let (client, connection) = self
            .config
            .pg_config(&self.config.admin_db)
            .connect(NoTls)
            .await
            .map_err(|e| provisioning(format!("connect to {}: {}", self.config.admin_db, e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("[TENANT] admin connection closed with error: {}", e);
            }
        });

        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&tenant.as_str()],
            )
            .await
            .map_err(|e| provisioning(format!("check database exists: {}", e)))?;
        let exists: bool = row.get(0);
        if exists {
            return Ok(());
        }

        // Tenant names are validated to [A-Za-z0-9_-], so quoting is enough.
        match client
            .batch_execute(&format!("CREATE DATABASE \"{}\"", tenant))
            .await
        {
            Ok(()) => {
                tracing::info!("[TENANT {}] database created", tenant);
                Ok(())
            }
            // Another gateway process won the race.
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(()),
            Err(e) => Err(provisioning(format!("create database: {}", e))),
        }
    }

    async fn connect(&self, tenant: &TenantName) -> Result<Self::Handle> {
        let connection = |reason: String| MiddlemanError::Connection {
            tenant: tenant.to_string(),
            reason,
        };

        let manager = Manager::from_config(
            self.config.pg_config(tenant.as_str()),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let max_lifetime = Duration::from_secs(self.config.max_lifetime_secs);
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let pool = Pool::builder(manager)
            .max_size(self.config.max_open)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .pre_recycle(Hook::sync_fn(move |_, metrics| {
                if metrics.age() > max_lifetime {
                    Err(HookError::Message("connection exceeded max lifetime".into()))
                } else {
                    Ok(())
                }
            }))
            .build()
            .map_err(|e| connection(format!("build pool: {}", e)))?;

        // Pools connect lazily; check out one connection so a bad server
        // or credentials surface here instead of on the first query.
        pool.get()
            .await
            .map_err(|e| connection(format!("open connection: {}", e)))?;

        Ok(pool)
    }

    async fn init_schema(&self, tenant: &TenantName, handle: &Self::Handle) -> Result<()> {
        let statements: Vec<&str> = if tenant.is_default() {
            DIRECTORY_SCHEMA.to_vec()
        } else {
            self.tenant_schema.iter().map(String::as_str).collect()
        };
        if statements.is_empty() {
            return Ok(());
        }

        let client = handle.get().await?;
        for statement in statements {
            client.batch_execute(statement).await?;
        }
        tracing::debug!("[TENANT {}] schema initialized", tenant);
        Ok(())
    }
}
