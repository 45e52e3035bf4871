//! SpireAgent CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CommonConfig, LoggingSpec, OperandResourceStatus, impl_has_conditions};

/// SpireAgent is the Schema for the spireagents API
///
/// Declares the SPIRE node agent, run as a DaemonSet on every schedulable node.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workload-identity.smoketurner.com",
    version = "v1alpha1",
    kind = "SpireAgent",
    plural = "spireagents",
    status = "OperandResourceStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpireAgentSpec {
    #[serde(flatten, default)]
    pub logging: LoggingSpec,

    #[serde(default)]
    pub node_attestor: NodeAttestorSpec,

    #[serde(default)]
    pub workload_attestors: WorkloadAttestorsSpec,

    #[serde(flatten, default)]
    pub common: CommonConfig,
}

/// Node attestation plugins
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttestorSpec {
    /// Attest nodes with projected service account tokens
    #[serde(default = "default_true")]
    pub k8s_psat_enabled: bool,
}

impl Default for NodeAttestorSpec {
    fn default() -> Self {
        Self {
            k8s_psat_enabled: true,
        }
    }
}

/// Workload attestation plugins
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAttestorsSpec {
    /// Attest workloads through the kubelet
    #[serde(default = "default_true")]
    pub k8s_enabled: bool,

    /// Skip container-level selectors (pod-level selectors only)
    #[serde(default)]
    pub disable_container_selectors: bool,
}

impl Default for WorkloadAttestorsSpec {
    fn default() -> Self {
        Self {
            k8s_enabled: true,
            disable_container_selectors: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl_has_conditions!(SpireAgent);
