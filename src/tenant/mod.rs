pub mod directory;
pub mod postgres;
pub mod registry;

pub use directory::{BranchDirectory, NodeDirectory};
pub use postgres::{PgProvisioner, StoreConfig, TenantStore};
pub use registry::{StoreProvisioner, TenantRegistry};

/// Registry backed by one Postgres database per tenant.
pub type PgRegistry = TenantRegistry<PgProvisioner>;
