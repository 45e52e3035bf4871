//! WorkloadIdentityManager CRD definition
//!
//! The top-level, cluster-wide resource. It owns the four operand resources
//! and aggregates their health into composite Ready, Upgradeable and Degraded
//! conditions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CommonConfig, Condition, OperandKind, OperandStatus, impl_has_conditions};

/// WorkloadIdentityManager is the Schema for the workloadidentitymanagers API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workload-identity.smoketurner.com",
    version = "v1alpha1",
    kind = "WorkloadIdentityManager",
    plural = "workloadidentitymanagers",
    shortname = "wim",
    status = "WorkloadIdentityManagerStatus",
    printcolumn = r#"{"name":"Trust Domain", "type":"string", "jsonPath":".spec.trustDomain"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityManagerSpec {
    /// SPIFFE trust domain (e.g., "example.org"); immutable once set
    pub trust_domain: String,

    /// Cluster name used by node and workload attestation; immutable once set
    pub cluster_name: String,

    /// ConfigMap the server publishes its trust bundle to
    #[serde(default = "default_bundle_config_map")]
    pub bundle_config_map: String,

    #[serde(flatten, default)]
    pub common: CommonConfig,
}

fn default_bundle_config_map() -> String {
    "spire-bundle".to_string()
}

/// Status of the WorkloadIdentityManager
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityManagerStatus {
    /// Composite conditions (Ready, Upgradeable, Degraded), keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last published health of each operand, keyed by kind
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<OperandStatus>,
}

impl WorkloadIdentityManagerStatus {
    /// Insert or replace the entry for `entry.kind`
    pub fn upsert_operand(&mut self, entry: OperandStatus) {
        match self.operands.iter_mut().find(|o| o.kind == entry.kind) {
            Some(existing) => *existing = entry,
            None => {
                self.operands.push(entry);
                self.operands.sort_by_key(|o| o.kind);
            }
        }
    }

    /// Drop the entry for `kind`, returning it if one was published
    pub fn remove_operand(&mut self, kind: OperandKind) -> Option<OperandStatus> {
        let index = self.operands.iter().position(|o| o.kind == kind)?;
        Some(self.operands.remove(index))
    }

    /// Entry for a given operand kind, if it has reported yet
    pub fn operand(&self, kind: OperandKind) -> Option<&OperandStatus> {
        self.operands.iter().find(|o| o.kind == kind)
    }
}

impl WorkloadIdentityManager {
    /// Operand entries currently published on the status
    pub fn operands(&self) -> &[OperandStatus] {
        self.status
            .as_ref()
            .map(|s| s.operands.as_slice())
            .unwrap_or(&[])
    }
}

impl_has_conditions!(WorkloadIdentityManager);
