//! SpireServer CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CommonConfig, LoggingSpec, OperandResourceStatus, impl_has_conditions};

/// SpireServer is the Schema for the spireservers API
///
/// Declares the SPIRE server: a StatefulSet with persistent storage that
/// issues identities for the configured trust domain.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workload-identity.smoketurner.com",
    version = "v1alpha1",
    kind = "SpireServer",
    plural = "spireservers",
    status = "OperandResourceStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireServerSpec {
    #[serde(flatten, default)]
    pub logging: LoggingSpec,

    /// Issuer written into JWT-SVIDs (defaults to the OIDC discovery address)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_issuer: Option<String>,

    /// Lifetime of the signing CA
    #[serde(default = "default_ca_validity")]
    pub ca_validity_seconds: i64,

    /// Default X509-SVID lifetime
    #[serde(default = "default_x509_validity")]
    pub default_x509_validity_seconds: i64,

    /// Default JWT-SVID lifetime
    #[serde(default = "default_jwt_validity")]
    pub default_jwt_validity_seconds: i64,

    /// Datastore volume
    #[serde(default)]
    pub persistence: PersistenceSpec,

    #[serde(flatten, default)]
    pub common: CommonConfig,
}

fn default_ca_validity() -> i64 {
    86400
}

fn default_x509_validity() -> i64 {
    3600
}

fn default_jwt_validity() -> i64 {
    300
}

/// Persistent volume for the server datastore
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Size of the volume (e.g., "1Gi")
    #[serde(default = "default_persistence_size")]
    pub size: String,

    /// Storage class (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default = "default_access_mode")]
    pub access_mode: String,
}

fn default_persistence_size() -> String {
    "1Gi".to_string()
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

impl Default for PersistenceSpec {
    fn default() -> Self {
        Self {
            size: default_persistence_size(),
            storage_class: None,
            access_mode: default_access_mode(),
        }
    }
}

impl_has_conditions!(SpireServer);
