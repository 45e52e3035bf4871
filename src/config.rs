//! Operator configuration read from the environment
//!
//! Every setting has a default so the operator runs without any variables set.

use crate::controller::create_only::CreateOnlySource;

/// Namespace operand child objects are created in
pub const OPERAND_NAMESPACE_ENV: &str = "OPERAND_NAMESPACE";
pub const DEFAULT_OPERAND_NAMESPACE: &str = "workload-identity-system";

pub const SPIRE_SERVER_IMAGE_ENV: &str = "RELATED_IMAGE_SPIRE_SERVER";
pub const SPIRE_AGENT_IMAGE_ENV: &str = "RELATED_IMAGE_SPIRE_AGENT";
pub const SPIFFE_CSI_DRIVER_IMAGE_ENV: &str = "RELATED_IMAGE_SPIFFE_CSI_DRIVER";
pub const OIDC_DISCOVERY_PROVIDER_IMAGE_ENV: &str = "RELATED_IMAGE_OIDC_DISCOVERY_PROVIDER";
pub const SPIRE_CONTROLLER_MANAGER_IMAGE_ENV: &str = "RELATED_IMAGE_SPIRE_CONTROLLER_MANAGER";
pub const NODE_DRIVER_REGISTRAR_IMAGE_ENV: &str = "RELATED_IMAGE_NODE_DRIVER_REGISTRAR";

/// Container images for the operands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    pub spire_server: String,
    pub spire_agent: String,
    pub spiffe_csi_driver: String,
    pub oidc_discovery_provider: String,
    pub spire_controller_manager: String,
    pub node_driver_registrar: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            spire_server: "ghcr.io/spiffe/spire-server:1.12.4".to_string(),
            spire_agent: "ghcr.io/spiffe/spire-agent:1.12.4".to_string(),
            spiffe_csi_driver: "ghcr.io/spiffe/spiffe-csi-driver:0.2.7".to_string(),
            oidc_discovery_provider: "ghcr.io/spiffe/oidc-discovery-provider:1.12.4".to_string(),
            spire_controller_manager: "ghcr.io/spiffe/spire-controller-manager:0.6.2".to_string(),
            node_driver_registrar:
                "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.13.0".to_string(),
        }
    }
}

/// Operator-wide settings shared by all controllers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace for operand child objects
    pub operand_namespace: String,
    /// Operand container images
    pub images: Images,
    /// Source of the create-only flag (read on every reconcile)
    pub create_only: CreateOnlySource,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operand_namespace: DEFAULT_OPERAND_NAMESPACE.to_string(),
            images: Images::default(),
            create_only: CreateOnlySource::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Images::default();
        let var = |name: &str, default: String| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        Self {
            operand_namespace: var(OPERAND_NAMESPACE_ENV, DEFAULT_OPERAND_NAMESPACE.to_string()),
            images: Images {
                spire_server: var(SPIRE_SERVER_IMAGE_ENV, defaults.spire_server),
                spire_agent: var(SPIRE_AGENT_IMAGE_ENV, defaults.spire_agent),
                spiffe_csi_driver: var(SPIFFE_CSI_DRIVER_IMAGE_ENV, defaults.spiffe_csi_driver),
                oidc_discovery_provider: var(
                    OIDC_DISCOVERY_PROVIDER_IMAGE_ENV,
                    defaults.oidc_discovery_provider,
                ),
                spire_controller_manager: var(
                    SPIRE_CONTROLLER_MANAGER_IMAGE_ENV,
                    defaults.spire_controller_manager,
                ),
                node_driver_registrar: var(
                    NODE_DRIVER_REGISTRAR_IMAGE_ENV,
                    defaults.node_driver_registrar,
                ),
            },
            create_only: CreateOnlySource::default(),
        }
    }
}
