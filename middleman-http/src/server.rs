use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use middleman::tenant::{BranchDirectory, NodeDirectory, PgProvisioner, StoreProvisioner};
use middleman::{ExpiringCache, PgRegistry};
use middleman_sync::{spawn_retry_worker, GatewayConfig, RetryManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{
    current_tenant, drain_outbox, health, list_slaves, outbox_status, register, AppState,
};
use crate::middleware::resolve_tenant;

pub const CACHE_DIR: &str = "cache";

/// Build the gateway router over `state`.
pub fn router<P: StoreProvisioner>(state: Arc<AppState<P>>) -> Router {
    // Routes scoped to one branch node through the SLAVE-NAME header.
    let tenant_routes = Router::new()
        .route("/middleman/tenant/", get(current_tenant::<P>))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_tenant::<P>,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::<P>))
        .route("/register/", post(register::<P>))
        .route("/middleman/slave-nodes/", get(list_slaves::<P>))
        .route("/internal/outbox", get(outbox_status::<P>))
        .route("/internal/outbox/drain", post(drain_outbox::<P>))
        .with_state(state)
        .merge(tenant_routes)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = PathBuf::from(
        std::env::var("MIDDLEMAN_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    );
    std::fs::create_dir_all(&data_dir)?;

    let mut config = GatewayConfig::load_or_default(&data_dir);
    config.apply_bind_override(std::env::var("MIDDLEMAN_BIND_ADDR").ok());

    // Without the default store there is no branch-node directory to serve.
    let registry = match PgRegistry::bootstrap(PgProvisioner::new(config.database.clone())).await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[TENANT] failed to provision the default store: {}", e);
            return Err(e.into());
        }
    };
    let directory: Arc<dyn NodeDirectory> =
        Arc::new(BranchDirectory::new(registry.default_store().await?));

    let cache = Arc::new(ExpiringCache::open(&data_dir.join(CACHE_DIR))?);
    let retryer = RetryManager::open(&data_dir, config.retry_policy())?;
    tracing::info!(
        "[RETRY] outbox at {}, {} pending",
        data_dir.display(),
        retryer.pending()?.len()
    );

    let shutdown = CancellationToken::new();
    let worker = spawn_retry_worker(Arc::clone(&retryer), shutdown.clone());

    let bind_addr = config.bind_addr.clone();
    let node_name = config.node_name.clone();
    let state = Arc::new(AppState {
        config,
        registry,
        directory,
        cache: Arc::clone(&cache),
        retryer,
    });
    let app = router(state);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    tracing::info!("Starting Middleman gateway {} on {}", node_name, bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // The worker finishes its in-flight pass before it observes the token.
    shutdown.cancel();
    if let Err(e) = worker.await {
        tracing::error!("[RETRY] worker ended abnormally: {}", e);
    }

    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.close(),
        Err(_) => tracing::warn!("[CACHE] still referenced at shutdown, skipping close"),
    }

    tracing::info!("Middleman gateway stopped");
    Ok(())
}
