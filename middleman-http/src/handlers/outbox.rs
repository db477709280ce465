use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use middleman::tenant::StoreProvisioner;
use middleman::MiddlemanError;
use std::sync::Arc;

/// GET /internal/outbox
/// Counters plus every request still waiting for delivery.
pub async fn outbox_status<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
) -> Result<impl IntoResponse, MiddlemanError> {
    let status = state.retryer.status()?;
    let records = state.retryer.pending()?;

    Ok(Json(serde_json::json!({
        "status": status,
        "records": records,
    })))
}

/// POST /internal/outbox/drain
/// Run one drain pass now instead of waiting for the next tick.
pub async fn drain_outbox<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
) -> impl IntoResponse {
    match state.retryer.drain().await {
        Some(report) => (StatusCode::OK, Json(serde_json::json!(report))).into_response(),
        None => {
            tracing::info!("[RETRY] manual drain rejected, a pass is already running");
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "A drain pass is already running",
                    "code": 40900
                })),
            )
                .into_response()
        }
    }
}
