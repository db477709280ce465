use middleman::tenant::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub node_name: String,
    pub bind_addr: String,
    /// Shared secret a branch node must present to register.
    #[serde(default)]
    pub bootstrap_token: String,
    #[serde(default)]
    pub database: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: middleman::outbox::DEFAULT_MAX_RETRIES,
            interval_secs: 60,
            request_timeout_secs: 120,
        }
    }
}

/// Runtime form of [`RetryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries.max(1),
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
        }
    }
}

impl GatewayConfig {
    /// Load gateway configuration from {data_dir}/gateway.json or fall back
    /// to defaults taken from `MIDDLEMAN_*` environment variables.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let gateway_json = data_dir.join("gateway.json");

        if gateway_json.exists() {
            match std::fs::read_to_string(&gateway_json) {
                Ok(content) => match serde_json::from_str::<GatewayConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded gateway config: node_name={}, bind_addr={}, db={}:{}",
                            config.node_name,
                            config.bind_addr,
                            config.database.host,
                            config.database.port
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse gateway.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read gateway.json: {}, using defaults", e);
                }
            }
        }

        let node_name = std::env::var("MIDDLEMAN_NODE_NAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        });

        let bind_addr =
            std::env::var("MIDDLEMAN_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:9988".to_string());

        let bootstrap_token = std::env::var("MIDDLEMAN_BOOTSTRAP_TOKEN").unwrap_or_default();

        tracing::info!(
            "No gateway.json found, using environment defaults: node_name={}",
            node_name
        );

        GatewayConfig {
            node_name,
            bind_addr,
            bootstrap_token,
            database: StoreConfig::default().with_env_overrides(),
            retry: RetryConfig::default(),
        }
    }

    /// Listen address given on the command line or in `MIDDLEMAN_BIND_ADDR`
    /// wins over the one read from gateway.json.
    pub fn apply_bind_override(&mut self, bind_addr: Option<String>) {
        if let Some(addr) = bind_addr.filter(|a| !a.trim().is_empty()) {
            if addr != self.bind_addr {
                tracing::info!("bind_addr overridden: {} -> {}", self.bind_addr, addr);
            }
            self.bind_addr = addr;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}
