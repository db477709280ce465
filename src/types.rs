use crate::error::{MiddlemanError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the tenant whose store holds the branch-node directory.
pub const DEFAULT_TENANT: &str = "middleman";

// Tenant names double as Postgres database names, so they must stay within
// the 63-byte identifier limit and never need escaping.
static TENANT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,62}$").expect("valid tenant name regex"));

/// Validated name of a branch node (tenant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantName(String);

impl TenantName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if TENANT_NAME_RE.is_match(&name) {
            Ok(TenantName(name))
        } else {
            Err(MiddlemanError::InvalidTenantName(name))
        }
    }

    pub fn default_tenant() -> Self {
        TenantName(DEFAULT_TENANT.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_TENANT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantName {
    type Error = MiddlemanError;

    fn try_from(value: String) -> Result<Self> {
        TenantName::new(value)
    }
}

impl From<TenantName> for String {
    fn from(name: TenantName) -> Self {
        name.0
    }
}

impl AsRef<str> for TenantName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(MiddlemanError::Registration(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered branch node. `endpoint` and `private_token` address the
/// central authority this node mirrors into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    pub name: TenantName,
    pub display: String,
    pub role: Role,
    pub endpoint: String,
    #[serde(default, skip_serializing)]
    pub private_token: String,
    pub access_key: String,
    pub secret_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload for a branch node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNode {
    pub name: TenantName,
    pub display: String,
    pub role: Role,
    pub endpoint: String,
    pub private_token: String,
    #[serde(default)]
    pub ignore_same_name: bool,
}

impl RegisterNode {
    pub fn validate(&self) -> Result<()> {
        if self.display.trim().is_empty() {
            return Err(MiddlemanError::Registration("display is required".into()));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(MiddlemanError::Registration(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        if self.private_token.is_empty() {
            return Err(MiddlemanError::Registration(
                "private_token is required".into(),
            ));
        }
        Ok(())
    }
}
