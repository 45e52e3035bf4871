//! Types shared by every workload identity resource kind
//!
//! The scheduling block mirrors the subset of the core/v1 pod scheduling API
//! the operator exposes. It is converted into k8s-openapi types when pod
//! templates are rendered (see `resources::common`).

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all workload identity resources
pub const API_GROUP: &str = "workload-identity.smoketurner.com";

/// API version (group/version) for all workload identity resources
pub const API_VERSION: &str = "workload-identity.smoketurner.com/v1alpha1";

/// Every resource kind managed by the operator is a cluster-wide singleton
/// with this name.
pub const SINGLETON_NAME: &str = "cluster";

/// Configuration shared by the top-level resource and all operands
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    /// Extra labels applied to every child object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Resource requirements for the operand containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Scheduling affinity for operand pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations for operand pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Node selector for operand pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Resource requirements for operand containers
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Pod scheduling affinity
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
}

/// Node affinity scheduling rules
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    /// Hard requirement: pods are only scheduled onto nodes matching one of the terms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_during_scheduling_ignored_during_execution: Option<NodeSelector>,

    /// Soft preferences, weighted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_during_scheduling_ignored_during_execution: Vec<PreferredSchedulingTerm>,
}

/// A list of node selector terms; the terms are ORed
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// A node selector term; its requirements are ANDed
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

/// A single node selector requirement (key, operator, values)
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,

    /// One of In, NotIn, Exists, DoesNotExist, Gt, Lt
    pub operator: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// A weighted node selector term
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreferredSchedulingTerm {
    /// Weight in the range 1-100
    pub weight: i32,

    pub preference: NodeSelectorTerm,
}

/// Pod toleration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Exists or Equal (defaults to Equal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// NoSchedule, PreferNoSchedule or NoExecute (empty matches all effects)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// The four operand kinds aggregated by the top-level resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandKind {
    SpireServer,
    SpireAgent,
    SpiffeCsiDriver,
    SpireOidcDiscoveryProvider,
}

impl OperandKind {
    pub const ALL: [OperandKind; 4] = [
        OperandKind::SpireServer,
        OperandKind::SpireAgent,
        OperandKind::SpiffeCsiDriver,
        OperandKind::SpireOidcDiscoveryProvider,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperandKind::SpireServer => "SpireServer",
            OperandKind::SpireAgent => "SpireAgent",
            OperandKind::SpiffeCsiDriver => "SpiffeCsiDriver",
            OperandKind::SpireOidcDiscoveryProvider => "SpireOidcDiscoveryProvider",
        }
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ready token stored in [`OperandStatus::ready`]
pub const OPERAND_READY: &str = "true";
/// Not-ready token stored in [`OperandStatus::ready`]
pub const OPERAND_NOT_READY: &str = "false";

/// Per-operand health entry published on the top-level resource
///
/// The list on the top-level status is keyed by `kind`.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperandStatus {
    pub name: String,

    pub kind: OperandKind,

    /// "true" or "false"
    pub ready: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl OperandStatus {
    pub fn is_ready(&self) -> bool {
        self.ready == OPERAND_READY
    }
}

/// Status shared by all operand kinds
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperandResourceStatus {
    /// Kubernetes-style conditions, keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Access to a resource's condition list without knowing its concrete kind
pub trait HasConditions {
    /// Current conditions (empty when the status has never been written)
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating an empty status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Implements [`HasConditions`] for a kind whose status has a `conditions` list.
macro_rules! impl_has_conditions {
    ($kind:ty) => {
        impl $crate::crd::HasConditions for $kind {
            fn conditions(&self) -> &[$crate::crd::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or(&[])
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::crd::Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }
        }
    };
}

pub(crate) use impl_has_conditions;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Logging options shared by the SPIRE components
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    /// One of debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// text or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}
