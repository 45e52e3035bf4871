//! Operand abstraction and child object convergence
//!
//! Each operand kind renders an ordered list of [`ReconcileStep`]s. A step is
//! one logical resource class (service account, RBAC, workload, ...) and maps
//! to a single `<Class>Available` condition. The reconciler converges the
//! children of each step with [`Child::converge`].

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::controller::feature_gates::FeatureGates;
use crate::crd::{CommonConfig, HasConditions, OperandKind, WorkloadIdentityManager};
use crate::store::{ObjectStore, StoreObject, object_key};

/// Inputs available to an operand while rendering its children
pub struct RenderContext<'a> {
    /// The top-level resource owning the operand
    pub manager: &'a WorkloadIdentityManager,
    pub config: &'a OperatorConfig,
    pub feature_gates: &'a FeatureGates,
}

impl RenderContext<'_> {
    /// Namespace all namespaced children are created in
    pub fn namespace(&self) -> &str {
        &self.config.operand_namespace
    }
}

/// A managed operand resource kind
pub trait Operand: StoreObject + HasConditions {
    const KIND: OperandKind;

    /// Scheduling and labelling block shared by all operands
    fn common(&self) -> &CommonConfig;

    /// Desired children, grouped by the condition they report under
    fn steps(&self, ctx: &RenderContext<'_>) -> Result<Vec<ReconcileStep>>;
}

/// One logical resource class of an operand
#[derive(Clone, Debug)]
pub struct ReconcileStep {
    /// Condition type reported for this step (e.g. `ServiceAvailable`)
    pub condition_type: &'static str,
    pub children: Vec<Child>,
}

impl ReconcileStep {
    pub fn new(condition_type: &'static str, children: Vec<Child>) -> Self {
        Self {
            condition_type,
            children,
        }
    }
}

/// A desired child object
#[derive(Clone, Debug)]
pub enum Child {
    ServiceAccount(ServiceAccount),
    Service(Service),
    ConfigMap(ConfigMap),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Deployment(Deployment),
    CsiDriver(CSIDriver),
}

impl Child {
    /// `kind/namespace/name` of the child
    pub fn key(&self) -> String {
        fn key_of<K: StoreObject>(obj: &K) -> String {
            object_key::<K>(obj.namespace().as_deref(), &obj.name_any())
        }

        match self {
            Child::ServiceAccount(o) => key_of(o),
            Child::Service(o) => key_of(o),
            Child::ConfigMap(o) => key_of(o),
            Child::Role(o) => key_of(o),
            Child::RoleBinding(o) => key_of(o),
            Child::ClusterRole(o) => key_of(o),
            Child::ClusterRoleBinding(o) => key_of(o),
            Child::StatefulSet(o) => key_of(o),
            Child::DaemonSet(o) => key_of(o),
            Child::Deployment(o) => key_of(o),
            Child::CsiDriver(o) => key_of(o),
        }
    }

    /// Create the child if missing, otherwise update it when it diverged
    pub async fn converge<S: ObjectStore>(&self, store: &S, create_only: bool) -> Result<ChildOutcome> {
        match self {
            Child::ServiceAccount(o) => converge_object(store, o, create_only).await,
            Child::Service(o) => converge_object(store, o, create_only).await,
            Child::ConfigMap(o) => converge_object(store, o, create_only).await,
            Child::Role(o) => converge_object(store, o, create_only).await,
            Child::RoleBinding(o) => converge_object(store, o, create_only).await,
            Child::ClusterRole(o) => converge_object(store, o, create_only).await,
            Child::ClusterRoleBinding(o) => converge_object(store, o, create_only).await,
            Child::StatefulSet(o) => converge_object(store, o, create_only).await,
            Child::DaemonSet(o) => converge_object(store, o, create_only).await,
            Child::Deployment(o) => converge_object(store, o, create_only).await,
            Child::CsiDriver(o) => converge_object(store, o, create_only).await,
        }
    }
}

/// What [`converge_object`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    Created,
    Updated,
    Unchanged,
    /// Found but left untouched because create-only mode is on
    Skipped,
}

/// Converge a single object against the store
///
/// Missing objects are always created. Existing objects are left alone in
/// create-only mode, and otherwise updated only when the desired state is not
/// already a subset of what the store holds.
pub async fn converge_object<S, K>(store: &S, desired: &K, create_only: bool) -> Result<ChildOutcome>
where
    S: ObjectStore,
    K: StoreObject,
{
    let namespace = desired.namespace();
    let name = desired.name_any();
    let key = object_key::<K>(namespace.as_deref(), &name);

    let observed: K = match store.get(namespace.as_deref(), &name).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            store.create(desired).await?;
            info!(object = %key, "Created child object");
            return Ok(ChildOutcome::Created);
        }
        Err(e) => return Err(e),
    };

    if create_only {
        debug!(object = %key, "Create-only mode, leaving existing object untouched");
        return Ok(ChildOutcome::Skipped);
    }

    let desired_value = serde_json::to_value(desired)?;
    let observed_value = serde_json::to_value(&observed)?;
    if !needs_update(&desired_value, &observed_value) {
        return Ok(ChildOutcome::Unchanged);
    }

    let merged: K = serde_json::from_value(merge_for_update(desired_value, observed_value))?;
    store.update(&merged).await?;
    info!(object = %key, "Updated child object");
    Ok(ChildOutcome::Updated)
}

/// True when the observed object does not yet contain everything desired
///
/// Metadata is reduced to labels, annotations and owner references before the
/// comparison, and status is ignored.
pub fn needs_update(desired: &Value, observed: &Value) -> bool {
    !is_subset(&comparable(desired), &comparable(observed))
}

fn comparable(value: &Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            meta.retain(|k, _| matches!(k.as_str(), "labels" | "annotations" | "ownerReferences"));
        }
    }
    value
}

/// Structural subset test on JSON values
///
/// Every key of an object in `desired` must be present in `observed` with a
/// subset value. Arrays must have equal length and match element-wise.
/// Null, empty arrays and empty objects in `desired` match a missing field.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(have_v) => is_subset(v, have_v),
            None => is_empty_value(v),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (Value::Null, Value::Null) => true,
        (want, Value::Null) => is_empty_value(want),
        (want, have) => want == have,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Overlay the desired object onto the observed one
///
/// The observed metadata (resourceVersion, uid, ...) is kept. Labels and
/// annotations are merged with desired values winning, and desired owner
/// references replace observed ones. Everything else from `desired` is
/// overlaid recursively: objects merge key by key, arrays and scalars are
/// replaced.
pub fn merge_for_update(desired: Value, observed: Value) -> Value {
    let Value::Object(mut desired_map) = desired else {
        return desired;
    };
    let Value::Object(mut merged) = observed else {
        return Value::Object(desired_map);
    };

    let desired_meta = desired_map.remove("metadata");
    let observed_meta = merged.remove("metadata");
    merged.insert("metadata".to_string(), merge_metadata(desired_meta, observed_meta));

    for (key, value) in desired_map {
        let merged_value = match merged.remove(&key) {
            Some(existing) => overlay(value, existing),
            None => value,
        };
        merged.insert(key, merged_value);
    }

    Value::Object(merged)
}

fn merge_metadata(desired: Option<Value>, observed: Option<Value>) -> Value {
    let mut meta = match observed {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    let Some(Value::Object(desired)) = desired else {
        return Value::Object(meta);
    };

    for field in ["labels", "annotations"] {
        let Some(Value::Object(want)) = desired.get(field) else {
            continue;
        };
        let entry = meta
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(have) = entry {
            for (k, v) in want {
                have.insert(k.clone(), v.clone());
            }
        }
    }

    if let Some(owners) = desired.get("ownerReferences") {
        meta.insert("ownerReferences".to_string(), owners.clone());
    }

    Value::Object(meta)
}

fn overlay(desired: Value, observed: Value) -> Value {
    match (desired, observed) {
        (Value::Object(want), Value::Object(mut have)) => {
            for (k, v) in want {
                let merged = match have.remove(&k) {
                    Some(existing) => overlay(v, existing),
                    None => v,
                };
                have.insert(k, merged);
            }
            Value::Object(have)
        }
        (desired, _) => desired,
    }
}
