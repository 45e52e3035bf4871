//! Common utilities for child object generation
//!
//! Shared labels, owner references and conversion of the operand scheduling
//! block into core/v1 pod spec types.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{
    Affinity, CommonConfig, NodeSelectorRequirement, NodeSelectorTerm, ResourceList,
    ResourceRequirements, Toleration,
};

/// Operator field manager name
pub const FIELD_MANAGER: &str = "workload-identity-operator";

/// Label naming the application a child object belongs to
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
/// Label naming the operand component
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Label naming the managing operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label naming the operand kind that owns a child object
pub const OPERAND_LABEL: &str = "workload-identity.smoketurner.com/operand";

/// Generate an owner reference pointing at `owner`
///
/// Child objects are garbage collected when their owner is deleted.
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels used in pod selectors; never include user labels here
pub fn selector_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), app.to_string()),
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
    ])
}

/// Standard labels merged with the operand's user-defined labels
///
/// User labels can override anything except the selector labels, which
/// must stay stable for the workload selectors to keep matching.
pub fn child_labels(app: &str, component: &str, operand: &str, common: &CommonConfig) -> BTreeMap<String, String> {
    let mut labels = selector_labels(app);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels.insert(OPERAND_LABEL.to_string(), operand.to_string());

    for (key, value) in &common.labels {
        if key != NAME_LABEL && key != MANAGED_BY_LABEL {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels
}

/// Metadata for a child object owned by `owner`
pub fn child_meta<K: Resource<DynamicType = ()>>(
    name: &str,
    namespace: Option<&str>,
    labels: BTreeMap<String, String>,
    owner: &K,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(owner)]),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!out.is_empty()).then_some(out)
}

/// Container resource requirements from the operand spec
pub fn resource_requirements(resources: Option<&ResourceRequirements>) -> Option<corev1::ResourceRequirements> {
    let resources = resources?;
    Some(corev1::ResourceRequirements {
        limits: resources.limits.as_ref().and_then(quantities),
        requests: resources.requests.as_ref().and_then(quantities),
        ..Default::default()
    })
}

fn selector_requirement(req: &NodeSelectorRequirement) -> corev1::NodeSelectorRequirement {
    corev1::NodeSelectorRequirement {
        key: req.key.clone(),
        operator: req.operator.clone(),
        values: (!req.values.is_empty()).then(|| req.values.clone()),
    }
}

fn selector_term(term: &NodeSelectorTerm) -> corev1::NodeSelectorTerm {
    let convert = |reqs: &[NodeSelectorRequirement]| {
        (!reqs.is_empty()).then(|| reqs.iter().map(selector_requirement).collect())
    };
    corev1::NodeSelectorTerm {
        match_expressions: convert(&term.match_expressions),
        match_fields: convert(&term.match_fields),
    }
}

/// Pod affinity from the operand spec
pub fn affinity(affinity: Option<&Affinity>) -> Option<corev1::Affinity> {
    let node = affinity?.node_affinity.as_ref()?;
    Some(corev1::Affinity {
        node_affinity: Some(corev1::NodeAffinity {
            required_during_scheduling_ignored_during_execution: node
                .required_during_scheduling_ignored_during_execution
                .as_ref()
                .map(|s| corev1::NodeSelector {
                    node_selector_terms: s.node_selector_terms.iter().map(selector_term).collect(),
                }),
            preferred_during_scheduling_ignored_during_execution: (!node
                .preferred_during_scheduling_ignored_during_execution
                .is_empty())
            .then(|| {
                node.preferred_during_scheduling_ignored_during_execution
                    .iter()
                    .map(|p| corev1::PreferredSchedulingTerm {
                        weight: p.weight,
                        preference: selector_term(&p.preference),
                    })
                    .collect()
            }),
        }),
        ..Default::default()
    })
}

/// Pod tolerations from the operand spec
pub fn tolerations(tolerations: &[Toleration]) -> Option<Vec<corev1::Toleration>> {
    (!tolerations.is_empty()).then(|| {
        tolerations
            .iter()
            .map(|t| corev1::Toleration {
                key: t.key.clone(),
                operator: t.operator.clone(),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
            })
            .collect()
    })
}

/// Apply the operand's scheduling block to a pod spec
pub fn apply_scheduling(pod: &mut corev1::PodSpec, common: &CommonConfig) {
    pod.affinity = affinity(common.affinity.as_ref());
    pod.tolerations = tolerations(&common.tolerations);
    pod.node_selector = (!common.node_selector.is_empty()).then(|| common.node_selector.clone());
}

/// Mount a volume read-only or read-write
pub fn volume_mount(name: &str, path: &str, read_only: bool) -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Volume backed by a ConfigMap
pub fn config_map_volume(name: &str, config_map: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        config_map: Some(corev1::ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume backed by a host directory
pub fn host_path_volume(name: &str, path: &str, type_: &str) -> corev1::Volume {
    corev1::Volume {
        name: name.to_string(),
        host_path: Some(corev1::HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

/// Container port over TCP
pub fn tcp_port(name: &str, port: i32) -> corev1::ContainerPort {
    corev1::ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// HTTP GET probe against a named port
pub fn http_probe(path: &str, port: &str, initial_delay: i32, period: i32) -> corev1::Probe {
    corev1::Probe {
        http_get: Some(corev1::HTTPGetAction {
            path: Some(path.to_string()),
            port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}
