//! Status and conditions management
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and for writing the status subresource under optimistic concurrency.

use chrono::Utc;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result, RetryConfig};
use crate::crd::Condition;
use crate::store::{ObjectStore, StoreObject, object_key};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Resource is fully reconciled and ready
    pub const READY: &str = "Ready";
    /// The stack may be upgraded
    pub const UPGRADEABLE: &str = "Upgradeable";
    /// Irrecoverable failure that needs administrator action
    pub const DEGRADED: &str = "Degraded";
    /// Operand configuration passed validation
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// Updates to existing child objects are suppressed
    pub const CREATE_ONLY_MODE: &str = "CreateOnlyMode";

    pub const SERVICE_ACCOUNT_AVAILABLE: &str = "ServiceAccountAvailable";
    pub const SERVICE_AVAILABLE: &str = "ServiceAvailable";
    pub const RBAC_AVAILABLE: &str = "RBACAvailable";
    pub const CONFIG_MAP_AVAILABLE: &str = "ConfigMapAvailable";
    pub const CSI_DRIVER_AVAILABLE: &str = "CSIDriverAvailable";
    pub const STATEFUL_SET_AVAILABLE: &str = "StatefulSetAvailable";
    pub const DAEMON_SET_AVAILABLE: &str = "DaemonSetAvailable";
    pub const DEPLOYMENT_AVAILABLE: &str = "DeploymentAvailable";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";

    pub fn from_bool(value: bool) -> &'static str {
        if value { TRUE } else { FALSE }
    }
}

/// Builder for creating and updating status conditions
///
/// Conditions are keyed by type: setting an existing type updates it in place.
/// `lastTransitionTime` only moves when the status changes.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::READY,
            condition_status::from_bool(is_ready),
            reason,
            message,
        )
    }

    /// Set the Upgradeable condition
    pub fn upgradeable(self, is_upgradeable: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::UPGRADEABLE,
            condition_status::from_bool(is_upgradeable),
            reason,
            message,
        )
    }

    /// Set the Degraded condition
    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            condition_status::from_bool(is_degraded),
            reason,
            message,
        )
    }

    /// Apply a queued update
    pub fn apply(self, update: &ConditionUpdate) -> Self {
        self.set_condition(&update.type_, &update.status, &update.reason, &update.message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// A condition change queued during a reconcile and applied at write time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(type_: &str, status: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == condition_status::TRUE
    }
}

/// Ordered set of queued condition updates, at most one per type
#[derive(Clone, Debug, Default)]
pub struct PendingConditions {
    updates: Vec<ConditionUpdate>,
}

impl PendingConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update, replacing an earlier one of the same type
    pub fn push(&mut self, update: ConditionUpdate) {
        match self.updates.iter_mut().find(|u| u.type_ == update.type_) {
            Some(existing) => *existing = update,
            None => self.updates.push(update),
        }
    }

    pub fn set(&mut self, type_: &str, status: &str, reason: &str, message: impl Into<String>) {
        self.push(ConditionUpdate::new(type_, status, reason, message));
    }

    pub fn get(&self, type_: &str) -> Option<&ConditionUpdate> {
        self.updates.iter().find(|u| u.type_ == type_)
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Merge the queued updates into an existing condition list
    pub fn apply_to(&self, existing: Vec<Condition>, generation: Option<i64>) -> Vec<Condition> {
        self.updates
            .iter()
            .fold(
                ConditionBuilder::from_existing(existing, generation),
                |builder, update| builder.apply(update),
            )
            .build()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == condition_status::TRUE)
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Writes status mutations with retry-on-conflict
///
/// Every attempt re-reads the latest object and re-applies the caller's
/// mutation to that fresh copy, so a write is never based on stale data even
/// when several controllers write the same resource.
pub struct StatusManager<'a, S> {
    store: &'a S,
    retry: &'a RetryConfig,
    cancel: &'a CancellationToken,
}

impl<'a, S: ObjectStore> StatusManager<'a, S> {
    /// Create a new status manager
    pub fn new(store: &'a S, retry: &'a RetryConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            store,
            retry,
            cancel,
        }
    }

    /// Apply `mutate` to the latest version of an object and write its status
    ///
    /// The write is skipped when the mutation leaves the object unchanged.
    /// Conflicts are retried up to the configured budget; the last error is
    /// returned on exhaustion. Any other error is returned immediately.
    pub async fn update<K, F>(&self, namespace: Option<&str>, name: &str, mut mutate: F) -> Result<K>
    where
        K: StoreObject,
        F: FnMut(&mut K) + Send,
    {
        let key = object_key::<K>(namespace, name);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut latest: K = self.store.get(namespace, name).await?;
            let before = serde_json::to_value(&latest)?;
            mutate(&mut latest);
            if serde_json::to_value(&latest)? == before {
                debug!(object = %key, "Status unchanged, skipping write");
                return Ok(latest);
            }

            match self.store.update_status(&latest).await {
                Ok(written) => {
                    debug!(
                        object = %key,
                        attempt,
                        resource_version = written.resource_version().unwrap_or_default(),
                        "Status written"
                    );
                    return Ok(written);
                }
                Err(e) if e.is_conflict() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_retry(attempt);
                    debug!(
                        object = %key,
                        attempt,
                        ?delay,
                        "Status write conflicted, retrying against latest version"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_conflict() {
                        warn!(object = %key, attempt, "Status write retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
