use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use middleman::tenant::{NodeDirectory, StoreConfig, StoreProvisioner};
use middleman::{BranchNode, MiddlemanError, RegisterNode, Result, Role, TenantName, TenantRegistry};
use middleman_http::handlers::AppState;
use middleman_sync::{GatewayConfig, RetryConfig, RetryManager, RetryPolicy};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// Provisioner whose "store" is just the tenant name.
#[derive(Default)]
struct FakeProvisioner {
    broken: Mutex<HashSet<String>>,
}

#[async_trait]
impl StoreProvisioner for FakeProvisioner {
    type Handle = String;

    async fn ensure_store(&self, tenant: &TenantName) -> Result<()> {
        if self.broken.lock().unwrap().contains(tenant.as_str()) {
            return Err(MiddlemanError::Database("permission denied to create database".into()));
        }
        Ok(())
    }

    async fn connect(&self, tenant: &TenantName) -> Result<String> {
        Ok(tenant.to_string())
    }

    async fn init_schema(&self, _tenant: &TenantName, _handle: &String) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryDirectory {
    nodes: Mutex<Vec<BranchNode>>,
}

#[async_trait]
impl NodeDirectory for MemoryDirectory {
    async fn register(&self, req: &RegisterNode) -> Result<BranchNode> {
        req.validate()?;
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.iter().any(|n| n.name == req.name) {
            return Err(MiddlemanError::Registration(format!(
                "name '{}' is already registered",
                req.name
            )));
        }
        let now = chrono::Utc::now();
        let node = BranchNode {
            name: req.name.clone(),
            display: req.display.clone(),
            role: req.role,
            endpoint: req.endpoint.clone(),
            private_token: req.private_token.clone(),
            access_key: format!("ak-{}", req.name),
            secret_key: format!("sk-{}", req.name),
            created_at: now,
            updated_at: now,
        };
        nodes.push(node.clone());
        Ok(node)
    }

    async fn find(&self, name: &TenantName, role: Option<Role>) -> Result<Option<BranchNode>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| &n.name == name && role.map_or(true, |r| n.role == r))
            .cloned())
    }

    async fn list(&self, role: Role) -> Result<Vec<BranchNode>> {
        let mut nodes: Vec<_> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.role == role)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

struct Harness {
    _tmp: TempDir,
    state: Arc<AppState<FakeProvisioner>>,
    app: Router,
}

fn harness(bootstrap_token: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = GatewayConfig {
        node_name: "hq".into(),
        bind_addr: "127.0.0.1:0".into(),
        bootstrap_token: bootstrap_token.into(),
        database: StoreConfig::default(),
        retry: RetryConfig::default(),
    };
    let policy = RetryPolicy {
        max_retries: 10,
        interval: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
    };
    let state = Arc::new(AppState {
        config,
        registry: Arc::new(TenantRegistry::new(FakeProvisioner::default())),
        directory: Arc::new(MemoryDirectory::default()) as Arc<dyn NodeDirectory>,
        cache: Arc::new(middleman::ExpiringCache::open(&tmp.path().join("cache")).unwrap()),
        retryer: RetryManager::open(tmp.path(), policy).unwrap(),
    });
    let app = middleman_http::router(Arc::clone(&state));
    Harness {
        _tmp: tmp,
        state,
        app,
    }
}

fn register_body(name: &str, role: &str, token: &str) -> serde_json::Value {
    serde_json::json!({
        "bootstrap_token": token,
        "name": name,
        "display": format!("Branch {}", name),
        "role": role,
        "endpoint": "https://jms.example.com",
        "private_token": "private"
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    // Extractor rejections come back as plain text.
    let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
    });
    (status, body)
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_as(uri: &str, slave: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("SLAVE-NAME", slave)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness("boot");
    let (status, body) = send(&h.app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_name"], "hq");
    assert_eq!(body["outbox_pending"], 0);
    assert_eq!(body["cache_entries"], 0);
}

#[tokio::test]
async fn test_outbox_status_lists_pending_records() {
    let h = harness("boot");
    let id = h
        .state
        .retryer
        .enqueue(
            "POST",
            "http://127.0.0.1:1/api/v1/users/",
            BTreeMap::new(),
            Some("{}".into()),
            &"connection refused",
        )
        .unwrap();

    let (status, body) = send(&h.app, get("/internal/outbox")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["pending"], 1);
    assert_eq!(body["status"]["max_retries"], 10);
    assert_eq!(body["records"][0]["id"], id.to_string());
    assert_eq!(body["records"][0]["retry_count"], 0);
}

#[tokio::test]
async fn test_manual_drain_reports_pass() {
    let h = harness("boot");
    h.state
        .retryer
        .enqueue(
            "DELETE",
            "http://127.0.0.1:1/api/v1/users/1/",
            BTreeMap::new(),
            None,
            &"refused",
        )
        .unwrap();

    let (status, body) = send(&h.app, post_json("/internal/outbox/drain", &serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["loaded"], 1);
    assert_eq!(body["retried"], 1);
    assert_eq!(h.state.retryer.pending().unwrap()[0].retry_count, 1);
}

#[tokio::test]
async fn test_register_rejects_bad_token() {
    let h = harness("boot");
    let (status, body) = send(
        &h.app,
        post_json("/register/", &register_body("branch_a", "slave", "wrong")),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 40300);
    assert!(h.state.directory.list(Role::Slave).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_disabled_without_configured_token() {
    let h = harness("");
    let (status, _) = send(
        &h.app,
        post_json("/register/", &register_body("branch_a", "slave", "")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_register_slave_provisions_store() {
    let h = harness("boot");
    let (status, body) = send(
        &h.app,
        post_json("/register/", &register_body("branch_a", "slave", "boot")),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "branch_a");
    assert_eq!(body["access_key"], "ak-branch_a");
    assert!(body.get("private_token").is_none());

    let name = TenantName::new("branch_a").unwrap();
    assert!(h.state.registry.is_loaded(&name).await);
}

#[tokio::test]
async fn test_register_master_does_not_provision() {
    let h = harness("boot");
    let (status, _) = send(
        &h.app,
        post_json("/register/", &register_body("hq_two", "master", "boot")),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(h.state.registry.loaded().await.is_empty());
}

#[tokio::test]
async fn test_register_duplicate_name() {
    let h = harness("boot");
    let req = register_body("branch_a", "slave", "boot");
    send(&h.app, post_json("/register/", &req)).await;
    let (status, body) = send(&h.app, post_json("/register/", &req)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40003);
}

#[tokio::test]
async fn test_register_invalid_name_is_rejected() {
    let h = harness("boot");
    let (status, _) = send(
        &h.app,
        post_json("/register/", &register_body("bad name;", "slave", "boot")),
    )
    .await;
    assert!(status.is_client_error());
    assert!(h.state.directory.list(Role::Slave).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_slaves() {
    let h = harness("boot");
    for (name, role) in [("branch_b", "slave"), ("hq_two", "master"), ("branch_a", "slave")] {
        send(&h.app, post_json("/register/", &register_body(name, role, "boot"))).await;
    }

    let (status, body) = send(&h.app, get("/middleman/slave-nodes/")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["branch_a", "branch_b"]);
}

#[tokio::test]
async fn test_tenant_header_required() {
    let h = harness("boot");
    let (status, body) = send(&h.app, get("/middleman/tenant/")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40002);
}

#[tokio::test]
async fn test_tenant_header_invalid_or_unknown() {
    let h = harness("boot");

    let (status, body) = send(&h.app, get_as("/middleman/tenant/", "no such;name")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40002);

    let (status, body) = send(&h.app, get_as("/middleman/tenant/", "branch_x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40002);
    assert!(h.state.registry.loaded().await.is_empty());
}

#[tokio::test]
async fn test_tenant_header_resolves_registered_slave() {
    let h = harness("boot");
    send(
        &h.app,
        post_json("/register/", &register_body("branch_a", "slave", "boot")),
    )
    .await;

    let (status, body) = send(&h.app, get_as("/middleman/tenant/", "branch_a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "branch_a");
    assert_eq!(body["display"], "Branch branch_a");
}

#[tokio::test]
async fn test_tenant_header_master_is_not_a_tenant() {
    let h = harness("boot");
    send(
        &h.app,
        post_json("/register/", &register_body("hq_two", "master", "boot")),
    )
    .await;

    let (status, body) = send(&h.app, get_as("/middleman/tenant/", "hq_two")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40002);
}

#[tokio::test]
async fn test_tenant_provisioning_failure() {
    let h = harness("boot");
    let req = RegisterNode {
        name: TenantName::new("branch_bad").unwrap(),
        display: "Bad".into(),
        role: Role::Slave,
        endpoint: "https://jms.example.com".into(),
        private_token: "private".into(),
        ignore_same_name: false,
    };
    h.state.directory.register(&req).await.unwrap();
    h.state
        .registry
        .provisioner()
        .broken
        .lock()
        .unwrap()
        .insert("branch_bad".into());

    let (status, body) = send(&h.app, get_as("/middleman/tenant/", "branch_bad")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 40001);
    assert!(!h.state.registry.is_loaded(&req.name).await);
}
