//! SpiffeCsiDriver CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CommonConfig, OperandResourceStatus, impl_has_conditions};

/// SpiffeCsiDriver is the Schema for the spiffecsidrivers API
///
/// Declares the CSI driver that mounts the agent's Workload API socket into pods.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workload-identity.smoketurner.com",
    version = "v1alpha1",
    kind = "SpiffeCsiDriver",
    plural = "spiffecsidrivers",
    status = "OperandResourceStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpiffeCsiDriverSpec {
    /// Host directory holding the agent's Workload API socket
    #[serde(default = "default_agent_socket_path")]
    pub agent_socket_path: String,

    /// CSI driver name registered with the kubelet
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,

    #[serde(flatten, default)]
    pub common: CommonConfig,
}

fn default_agent_socket_path() -> String {
    "/run/spire/agent-sockets".to_string()
}

fn default_plugin_name() -> String {
    "csi.spiffe.io".to_string()
}

impl_has_conditions!(SpiffeCsiDriver);
