//! Composite status of the WorkloadIdentityManager
//!
//! The manager's Ready, Upgradeable and Degraded conditions are a pure
//! reduction over the operand entries already published on its status.
//! Operand kinds that have not reported yet do not block readiness.

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::operand::Operand;
use crate::controller::status::{
    ConditionUpdate, PendingConditions, condition_status, condition_types, is_condition_true,
};
use crate::crd::{
    HasConditions, OperandKind, OperandStatus, SINGLETON_NAME, SpiffeCsiDriver, SpireAgent,
    SpireOidcDiscoveryProvider, SpireServer, WorkloadIdentityManager,
};
use crate::store::{ObjectStore, object_key};

/// Reasons written on the manager conditions
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const OPERANDS_NOT_READY: &str = "OperandsNotReady";
    pub const CREATE_ONLY_MODE_ENABLED: &str = "CreateOnlyModeEnabled";
    pub const AS_EXPECTED: &str = "AsExpected";
    pub const INVALID_OPERAND_CONFIGURATION: &str = "InvalidOperandConfiguration";
}

/// Metrics label for the manager controller
const MANAGER_KIND: &str = "WorkloadIdentityManager";

/// The three composite conditions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateConditions {
    pub ready: ConditionUpdate,
    pub upgradeable: ConditionUpdate,
    pub degraded: ConditionUpdate,
}

impl AggregateConditions {
    pub fn into_pending(self) -> PendingConditions {
        let mut pending = PendingConditions::new();
        pending.push(self.ready);
        pending.push(self.upgradeable);
        pending.push(self.degraded);
        pending
    }
}

fn kind_list(kinds: &[OperandKind]) -> String {
    kinds
        .iter()
        .map(OperandKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reduce operand entries and the create-only toggle to composite conditions
///
/// Ready is vacuously True for an empty list. Upgradeable additionally
/// requires create-only mode to be off. Degraded is independent of both and
/// only tracks operands reporting `ConfigurationValid=False`.
pub fn aggregate(operands: &[OperandStatus], create_only_active: bool) -> AggregateConditions {
    let mut not_ready: Vec<OperandKind> = operands
        .iter()
        .filter(|o| !o.is_ready())
        .map(|o| o.kind)
        .collect();
    not_ready.sort();
    not_ready.dedup();

    let mut misconfigured: Vec<OperandKind> = operands
        .iter()
        .filter(|o| {
            o.conditions.iter().any(|c| {
                c.type_ == condition_types::CONFIG_VALID && c.status == condition_status::FALSE
            })
        })
        .map(|o| o.kind)
        .collect();
    misconfigured.sort();
    misconfigured.dedup();

    let ready = if not_ready.is_empty() {
        ConditionUpdate::new(
            condition_types::READY,
            condition_status::TRUE,
            reasons::READY,
            "All operands are ready",
        )
    } else {
        ConditionUpdate::new(
            condition_types::READY,
            condition_status::FALSE,
            reasons::OPERANDS_NOT_READY,
            format!("Operands not ready: {}", kind_list(&not_ready)),
        )
    };

    let upgradeable = if !not_ready.is_empty() {
        ConditionUpdate::new(
            condition_types::UPGRADEABLE,
            condition_status::FALSE,
            reasons::OPERANDS_NOT_READY,
            format!("Operands not ready: {}", kind_list(&not_ready)),
        )
    } else if create_only_active {
        ConditionUpdate::new(
            condition_types::UPGRADEABLE,
            condition_status::FALSE,
            reasons::CREATE_ONLY_MODE_ENABLED,
            "Create-only mode is enabled",
        )
    } else {
        ConditionUpdate::new(
            condition_types::UPGRADEABLE,
            condition_status::TRUE,
            reasons::READY,
            "All operands are ready",
        )
    };

    let degraded = if misconfigured.is_empty() {
        ConditionUpdate::new(
            condition_types::DEGRADED,
            condition_status::FALSE,
            reasons::AS_EXPECTED,
            "No operand reports an irrecoverable failure",
        )
    } else {
        ConditionUpdate::new(
            condition_types::DEGRADED,
            condition_status::TRUE,
            reasons::INVALID_OPERAND_CONFIGURATION,
            format!("Invalid configuration on: {}", kind_list(&misconfigured)),
        )
    };

    AggregateConditions {
        ready,
        upgradeable,
        degraded,
    }
}

/// Controller entry point for the manager
#[instrument(skip(manager, ctx), fields(name = %manager.name_any()))]
pub async fn reconcile<S: ObjectStore>(
    manager: Arc<WorkloadIdentityManager>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let name = manager.name_any();
    let start = Instant::now();
    let result = reconcile_manager(&name, &ctx).await;
    if result.is_ok() {
        ctx.reset_backoff(&object_key::<WorkloadIdentityManager>(None, &name));
    }

    if let Some(ref state) = ctx.health_state {
        match &result {
            Ok(_) => {
                state
                    .metrics
                    .record_reconcile(MANAGER_KIND, start.elapsed().as_secs_f64());
                state.mark_reconciled();
            }
            Err(_) => state.metrics.record_error(MANAGER_KIND),
        }
    }

    result
}

/// Error policy for the aggregation controller
pub fn error_policy<S: ObjectStore>(
    manager: Arc<WorkloadIdentityManager>,
    error: &Error,
    ctx: Arc<Context<S>>,
) -> Action {
    if matches!(error, Error::Cancelled) {
        return Action::await_change();
    }

    let key = object_key::<WorkloadIdentityManager>(None, &manager.name_any());
    let delay = ctx.requeue_delay(&key, error);
    warn!(name = %manager.name_any(), error = %error, ?delay, "Aggregation failed, requeuing");
    Action::requeue(delay)
}

/// Operand kinds whose singleton resource does not exist
async fn absent_operands<S: ObjectStore>(ctx: &Context<S>) -> Result<Vec<OperandKind>> {
    let mut absent = Vec::new();
    for kind in OperandKind::ALL {
        ctx.check_cancelled()?;
        let exists = match kind {
            OperandKind::SpireServer => operand_exists::<SpireServer, S>(ctx).await?,
            OperandKind::SpireAgent => operand_exists::<SpireAgent, S>(ctx).await?,
            OperandKind::SpiffeCsiDriver => operand_exists::<SpiffeCsiDriver, S>(ctx).await?,
            OperandKind::SpireOidcDiscoveryProvider => {
                operand_exists::<SpireOidcDiscoveryProvider, S>(ctx).await?
            }
        };
        if !exists {
            absent.push(kind);
        }
    }
    Ok(absent)
}

async fn operand_exists<O: Operand, S: ObjectStore>(ctx: &Context<S>) -> Result<bool> {
    match ctx.store.get::<O>(None, SINGLETON_NAME).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Recompute and persist the composite conditions of the manager
///
/// Entries of operands that no longer exist are dropped first. The reduction
/// runs inside the status write against the freshly fetched object, so
/// operand entries published concurrently are never overwritten.
pub async fn reconcile_manager<S: ObjectStore>(name: &str, ctx: &Context<S>) -> Result<Action> {
    if name != SINGLETON_NAME {
        debug!(name, "Ignoring WorkloadIdentityManager not named {}", SINGLETON_NAME);
        return Ok(Action::await_change());
    }

    ctx.check_cancelled()?;
    let create_only_active = ctx.config.create_only.is_enabled();
    let absent = absent_operands(ctx).await?;

    let result = ctx
        .status_manager()
        .update::<WorkloadIdentityManager, _>(None, name, |manager| {
            if let Some(status) = manager.status.as_mut() {
                for kind in &absent {
                    if status.remove_operand(*kind).is_some() {
                        debug!(kind = %kind, "Dropped entry of deleted operand");
                    }
                }
            }
            let generation = manager.meta().generation;
            let pending = aggregate(manager.operands(), create_only_active).into_pending();
            let merged = pending.apply_to(manager.conditions().to_vec(), generation);
            *manager.conditions_mut() = merged;
        })
        .await;

    let manager = match result {
        Ok(manager) => manager,
        Err(e) if e.is_not_found() => {
            debug!(name, "WorkloadIdentityManager not found, nothing to aggregate");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if let Some(ref state) = ctx.health_state {
        for kind in OperandKind::ALL {
            let ready = manager
                .status
                .as_ref()
                .and_then(|s| s.operand(kind))
                .map(OperandStatus::is_ready);
            state.metrics.set_operand_ready(kind.as_str(), ready);
        }
        state.metrics.set_create_only_mode(create_only_active);
    }

    info!(
        name,
        ready = is_condition_true(manager.conditions(), condition_types::READY),
        operands = manager.operands().len(),
        "Aggregated operand status"
    );
    Ok(Action::await_change())
}
