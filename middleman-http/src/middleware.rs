use crate::handlers::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use middleman::tenant::StoreProvisioner;
use middleman::{BranchNode, MiddlemanError, Role, TenantName};
use std::sync::Arc;

/// Header naming the branch node a request is scoped to.
pub const SLAVE_NAME_HEADER: &str = "slave-name";

/// The branch node a request is scoped to, with its live store handle.
#[derive(Clone)]
pub struct ResolvedTenant<H> {
    pub node: BranchNode,
    pub store: H,
}

/// Resolve the `SLAVE-NAME` header to a registered slave and its store.
///
/// A missing, malformed or unregistered name is rejected with code 40002;
/// a store that cannot be provisioned or reached with code 40001.
pub async fn resolve_tenant<P: StoreProvisioner>(
    State(state): State<Arc<AppState<P>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let raw = match request
        .headers()
        .get(SLAVE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => {
            return MiddlemanError::InvalidTenantName("missing SLAVE-NAME header".into())
                .into_response()
        }
    };

    let name = match TenantName::new(raw) {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };

    let node = match state.directory.find(&name, Some(Role::Slave)).await {
        Ok(Some(node)) => node,
        Ok(None) => return MiddlemanError::TenantNotFound(name.to_string()).into_response(),
        Err(e) => {
            tracing::error!("[TENANT {}] directory lookup failed: {}", name, e);
            return e.into_response();
        }
    };

    let store = match state.registry.resolve(&name).await {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!("[TENANT {}] {}", name, e);
            return e.into_response();
        }
    };

    request
        .extensions_mut()
        .insert(ResolvedTenant::<P::Handle> { node, store });
    next.run(request).await
}
