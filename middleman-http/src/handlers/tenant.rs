use crate::middleware::ResolvedTenant;
use axum::{Extension, Json};
use middleman::tenant::StoreProvisioner;

/// GET /middleman/tenant/
/// Echo the branch node the `SLAVE-NAME` header resolved to.
pub async fn current_tenant<P: StoreProvisioner>(
    Extension(tenant): Extension<ResolvedTenant<P::Handle>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": tenant.node.name,
        "display": tenant.node.display,
        "endpoint": tenant.node.endpoint,
    }))
}
