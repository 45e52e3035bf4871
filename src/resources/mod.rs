pub mod common;
pub mod spiffe_csi_driver;
pub mod spire_agent;
pub mod spire_oidc_discovery_provider;
pub mod spire_server;

pub use common::{FIELD_MANAGER, child_labels, owner_reference, selector_labels};
