//! SpireOidcDiscoveryProvider CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CommonConfig, LoggingSpec, OperandResourceStatus, impl_has_conditions};

/// SpireOidcDiscoveryProvider is the Schema for the spireoidcdiscoveryproviders API
///
/// Declares the OIDC discovery provider that publishes the JWKS of the
/// trust domain for JWT-SVID validation by third parties.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workload-identity.smoketurner.com",
    version = "v1alpha1",
    kind = "SpireOidcDiscoveryProvider",
    plural = "spireoidcdiscoveryproviders",
    status = "OperandResourceStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireOidcDiscoveryProviderSpec {
    #[serde(default = "default_replica_count")]
    pub replica_count: i32,

    /// Public issuer URL; the domain list defaults to the in-cluster service name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_issuer: Option<String>,

    #[serde(flatten, default)]
    pub logging: LoggingSpec,

    #[serde(flatten, default)]
    pub common: CommonConfig,
}

fn default_replica_count() -> i32 {
    1
}

impl_has_conditions!(SpireOidcDiscoveryProvider);
