use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use middleman::tenant::StoreProvisioner;
use middleman::{BranchNode, MiddlemanError, RegisterNode, Role};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub bootstrap_token: String,
    #[serde(flatten)]
    pub node: RegisterNode,
}

/// POST /register/
/// Register a branch node. A slave's store is provisioned before the
/// response goes out, so its first tenant-scoped request finds it ready.
pub async fn register<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, MiddlemanError> {
    let expected = &state.config.bootstrap_token;
    if expected.is_empty() || req.bootstrap_token != *expected {
        tracing::warn!("[TENANT {}] registration with bad bootstrap token", req.node.name);
        return Ok((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "Bootstrap token does not match",
                "code": 40300
            })),
        )
            .into_response());
    }

    let node = state.directory.register(&req.node).await?;
    if node.role == Role::Slave {
        state.registry.resolve(&node.name).await?;
    }

    Ok((StatusCode::CREATED, Json(node)).into_response())
}

/// GET /middleman/slave-nodes/
pub async fn list_slaves<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<Json<Vec<BranchNode>>, MiddlemanError> {
    Ok(Json(state.directory.list(Role::Slave).await?))
}
