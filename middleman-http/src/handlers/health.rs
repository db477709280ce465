use axum::{extract::State, Json};
use middleman::tenant::StoreProvisioner;
use std::sync::Arc;

use super::AppState;

/// Health check endpoint
pub async fn health<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
) -> Json<serde_json::Value> {
    let outbox_pending = state.retryer.pending().map(|p| p.len()).unwrap_or_default();
    let cache_entries = state.cache.len().unwrap_or_default();

    Json(serde_json::json!({
        "status": "ok",
        "node_name": state.config.node_name,
        "tenants_loaded": state.registry.loaded().await.len(),
        "outbox_pending": outbox_pending,
        "outbox_draining": state.retryer.is_draining(),
        "cache_entries": cache_entries,
        "build_profile": if cfg!(debug_assertions) { "debug" } else { "release" },
    }))
}
