mod common;
mod spiffe_csi_driver;
mod spire_agent;
mod spire_oidc_discovery_provider;
mod spire_server;
mod workload_identity_manager;

pub use common::*;
pub use spiffe_csi_driver::*;
pub use spire_agent::*;
pub use spire_oidc_discovery_provider::*;
pub use spire_server::*;
pub use workload_identity_manager::*;
