//! Branch-node directory kept in the default tenant's store.

use super::postgres::TenantStore;
use crate::error::{MiddlemanError, Result};
use crate::types::{BranchNode, RegisterNode, Role, TenantName};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_postgres::Row;

pub const DIRECTORY_SCHEMA: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS branch_nodes (
    id            BIGSERIAL PRIMARY KEY,
    name          VARCHAR(128) NOT NULL UNIQUE,
    display       VARCHAR(256) NOT NULL,
    role          VARCHAR(16)  NOT NULL,
    endpoint      TEXT         NOT NULL,
    private_token TEXT         NOT NULL,
    access_key    VARCHAR(36)  NOT NULL,
    secret_key    VARCHAR(36)  NOT NULL,
    created_at    TIMESTAMPTZ  NOT NULL DEFAULT now(),
    updated_at    TIMESTAMPTZ  NOT NULL DEFAULT now()
)"#];

const NODE_COLUMNS: &str =
    "name, display, role, endpoint, private_token, access_key, secret_key, created_at, updated_at";

const KEY_LEN: usize = 36;

/// Lookup and registration of branch nodes.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Register a branch node, or with `ignore_same_name` rotate the keys of
    /// an existing node of the same name.
    async fn register(&self, req: &RegisterNode) -> Result<BranchNode>;

    async fn find(&self, name: &TenantName, role: Option<Role>) -> Result<Option<BranchNode>>;

    /// All nodes with `role`, ordered by name.
    async fn list(&self, role: Role) -> Result<Vec<BranchNode>>;
}

pub struct BranchDirectory {
    store: TenantStore,
}

impl BranchDirectory {
    pub fn new(store: TenantStore) -> Self {
        BranchDirectory { store }
    }
}

#[async_trait]
impl NodeDirectory for BranchDirectory {
    async fn register(&self, req: &RegisterNode) -> Result<BranchNode> {
        req.validate()?;
        let client = self.store.get().await?;

        let existing: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM branch_nodes WHERE name = $1",
                &[&req.name.as_str()],
            )
            .await?
            .get(0);

        let access_key = random_key();
        let secret_key = random_key();

        let row = if existing == 0 {
            client
                .query_one(
                    &format!(
                        "INSERT INTO branch_nodes \
                         (name, display, role, endpoint, private_token, access_key, secret_key) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
                        NODE_COLUMNS
                    ),
                    &[
                        &req.name.as_str(),
                        &req.display,
                        &req.role.as_str(),
                        &req.endpoint,
                        &req.private_token,
                        &access_key,
                        &secret_key,
                    ],
                )
                .await?
        } else if req.ignore_same_name {
            client
                .query_one(
                    &format!(
                        "UPDATE branch_nodes SET access_key = $2, secret_key = $3, display = $4, \
                         updated_at = now() WHERE name = $1 RETURNING {}",
                        NODE_COLUMNS
                    ),
                    &[&req.name.as_str(), &access_key, &secret_key, &req.display],
                )
                .await?
        } else {
            return Err(MiddlemanError::Registration(format!(
                "name '{}' is already registered; pick another name or set ignore_same_name",
                req.name
            )));
        };

        let node = node_from_row(&row)?;
        tracing::info!("[TENANT {}] registered as {}", node.name, node.role);
        Ok(node)
    }

    async fn find(&self, name: &TenantName, role: Option<Role>) -> Result<Option<BranchNode>> {
        let client = self.store.get().await?;
        let row = match role {
            Some(role) => {
                client
                    .query_opt(
                        &format!(
                            "SELECT {} FROM branch_nodes WHERE name = $1 AND role = $2",
                            NODE_COLUMNS
                        ),
                        &[&name.as_str(), &role.as_str()],
                    )
                    .await?
            }
            None => {
                client
                    .query_opt(
                        &format!("SELECT {} FROM branch_nodes WHERE name = $1", NODE_COLUMNS),
                        &[&name.as_str()],
                    )
                    .await?
            }
        };
        row.as_ref().map(node_from_row).transpose()
    }

    async fn list(&self, role: Role) -> Result<Vec<BranchNode>> {
        let client = self.store.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM branch_nodes WHERE role = $1 ORDER BY name",
                    NODE_COLUMNS
                ),
                &[&role.as_str()],
            )
            .await?;
        rows.iter().map(node_from_row).collect()
    }
}

fn node_from_row(row: &Row) -> Result<BranchNode> {
    let name: String = row.try_get("name")?;
    let role: String = row.try_get("role")?;
    Ok(BranchNode {
        name: TenantName::new(name)?,
        display: row.try_get("display")?,
        role: Role::parse(&role)?,
        endpoint: row.try_get("endpoint")?,
        private_token: row.try_get("private_token")?,
        access_key: row.try_get("access_key")?,
        secret_key: row.try_get("secret_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}
