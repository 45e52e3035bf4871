//! Reconciliation logic for the operand resources
//!
//! One generic loop serves all four operand kinds. A pass fetches the operand
//! and its owning WorkloadIdentityManager, validates the scheduling block,
//! converges every child object step by step and finally persists the
//! resulting conditions, both on the operand and as the operand's entry on
//! the manager's status.

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::create_only;
use crate::controller::error::{Error, Result};
use crate::controller::operand::{ChildOutcome, Operand, ReconcileStep, RenderContext};
use crate::controller::status::{
    PendingConditions, condition_status, condition_types, find_condition,
};
use crate::controller::validation::validate_scheduling;
use crate::crd::{
    OPERAND_NOT_READY, OPERAND_READY, OperandStatus, SINGLETON_NAME, WorkloadIdentityManager,
};
use crate::resources::owner_reference;
use crate::store::{ObjectStore, object_key};

/// Condition reasons written by the operand reconciler
pub mod reasons {
    pub const AVAILABLE: &str = "Available";
    pub const VALID_CONFIGURATION: &str = "ValidConfiguration";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const READY: &str = "Ready";
}

/// Controller entry point for an operand kind
#[instrument(skip(operand, ctx), fields(kind = %O::KIND, name = %operand.name_any()))]
pub async fn reconcile<O, S>(operand: Arc<O>, ctx: Arc<Context<S>>) -> Result<Action>
where
    O: Operand,
    S: ObjectStore,
{
    let name = operand.name_any();
    let start = Instant::now();

    let result = reconcile_operand::<O, S>(&name, &ctx).await;
    if result.is_ok() {
        ctx.reset_backoff(&object_key::<O>(None, &name));
    }

    if let Some(ref state) = ctx.health_state {
        match &result {
            Ok(_) => {
                state
                    .metrics
                    .record_reconcile(O::KIND.as_str(), start.elapsed().as_secs_f64());
                state.mark_reconciled();
            }
            Err(_) => state.metrics.record_error(O::KIND.as_str()),
        }
    }

    result
}

/// Error policy for the operand controllers with exponential backoff
pub fn error_policy<O, S>(operand: Arc<O>, error: &Error, ctx: Arc<Context<S>>) -> Action
where
    O: Operand,
    S: ObjectStore,
{
    let name = operand.name_any();

    if matches!(error, Error::Cancelled) {
        debug!(kind = %O::KIND, name = %name, "Reconcile cancelled during shutdown");
        return Action::await_change();
    }

    let delay = ctx.requeue_delay(&object_key::<O>(None, &name), error);
    if error.is_retryable() {
        warn!(kind = %O::KIND, name = %name, error = %error, ?delay, "Retryable error, requeuing");
    } else {
        error!(kind = %O::KIND, name = %name, error = %error, ?delay, "Non-retryable error, requeuing");
    }

    Action::requeue(delay)
}

/// Converge one operand resource identified by `name`
///
/// Only the singleton named `cluster` is managed; other names are ignored.
/// Absence of the operand or of the manager is a successful no-op, apart from
/// withdrawing the operand's entry from the manager. Store errors and child
/// create/update failures are returned unchanged. Invalid configuration is
/// recorded as a condition and reported as success.
pub async fn reconcile_operand<O, S>(name: &str, ctx: &Context<S>) -> Result<Action>
where
    O: Operand,
    S: ObjectStore,
{
    if name != SINGLETON_NAME {
        debug!(kind = %O::KIND, name, "Ignoring operand not named {}", SINGLETON_NAME);
        return Ok(Action::await_change());
    }

    ctx.check_cancelled()?;
    let operand: O = match ctx.store.get(None, name).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            debug!(kind = %O::KIND, name, "Operand not found, nothing to reconcile");
            withdraw_operand_status::<O, S>(ctx).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    ctx.check_cancelled()?;
    let manager: WorkloadIdentityManager = match ctx.store.get(None, SINGLETON_NAME).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            debug!(kind = %O::KIND, name, "WorkloadIdentityManager not found, waiting for it");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let operand = ensure_owner_reference(ctx, operand, &manager).await?;
    let mut pending = PendingConditions::new();

    if let Err(violation) = validate_scheduling(operand.common()) {
        warn!(kind = %O::KIND, name, rule = violation.rule, "Invalid operand configuration");
        pending.set(
            condition_types::CONFIG_VALID,
            condition_status::FALSE,
            reasons::INVALID_CONFIGURATION,
            violation.to_string(),
        );
        pending.set(
            condition_types::READY,
            condition_status::FALSE,
            reasons::INVALID_CONFIGURATION,
            format!("Configuration is invalid: {}", violation),
        );
        let updated = persist_conditions::<O, S>(ctx, name, &pending).await?;
        publish_operand_status(ctx, &updated).await?;
        return Ok(Action::await_change());
    }
    pending.set(
        condition_types::CONFIG_VALID,
        condition_status::TRUE,
        reasons::VALID_CONFIGURATION,
        "Configuration is valid",
    );

    let decision = create_only::evaluate(ctx.config.create_only.read().as_deref(), operand.conditions());
    if let Some(update) = decision.condition {
        pending.push(update);
    }
    if let Some(ref state) = ctx.health_state {
        state.metrics.set_create_only_mode(decision.enabled);
    }

    let render = RenderContext {
        manager: &manager,
        config: &ctx.config,
        feature_gates: &ctx.feature_gates,
    };
    let steps = operand.steps(&render)?;

    for step in &steps {
        if let Err(e) = converge_step(ctx, step, decision.enabled).await {
            error!(kind = %O::KIND, name, step = step.condition_type, error = %e, "Reconcile step failed");
            record_failure::<O, S>(ctx, name, pending, step.condition_type, &e).await;
            return Err(e);
        }
        pending.set(
            step.condition_type,
            condition_status::TRUE,
            reasons::AVAILABLE,
            format!("{} resources are available", step_label(step.condition_type)),
        );
    }

    pending.set(
        condition_types::READY,
        condition_status::TRUE,
        reasons::READY,
        format!("All {} resources are available", O::KIND),
    );

    let updated = persist_conditions::<O, S>(ctx, name, &pending).await?;
    publish_operand_status(ctx, &updated).await?;

    info!(kind = %O::KIND, name, steps = steps.len(), "Reconciliation completed successfully");
    Ok(Action::await_change())
}

/// Bind the operand to the manager with a controller owner reference
async fn ensure_owner_reference<O, S>(
    ctx: &Context<S>,
    mut operand: O,
    manager: &WorkloadIdentityManager,
) -> Result<O>
where
    O: Operand,
    S: ObjectStore,
{
    let owner = owner_reference(manager);
    let already_owned = operand
        .owner_references()
        .iter()
        .any(|r| r.kind == owner.kind && r.name == owner.name && r.uid == owner.uid);
    if already_owned {
        return Ok(operand);
    }

    ctx.check_cancelled()?;
    let refs = operand.meta_mut().owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| !(r.kind == owner.kind && r.name == owner.name));
    refs.push(owner);

    let updated = ctx.store.update(&operand).await?;
    info!(kind = %O::KIND, name = %updated.name_any(), "Set owner reference to WorkloadIdentityManager");
    Ok(updated)
}

async fn converge_step<S: ObjectStore>(
    ctx: &Context<S>,
    step: &ReconcileStep,
    create_only: bool,
) -> Result<()> {
    for child in &step.children {
        ctx.check_cancelled()?;
        let outcome = child.converge(&ctx.store, create_only).await?;
        if outcome != ChildOutcome::Unchanged {
            debug!(object = %child.key(), ?outcome, "Child converged");
        }
    }
    Ok(())
}

/// Record a failed step and Ready=False; errors here are logged, not returned
async fn record_failure<O, S>(
    ctx: &Context<S>,
    name: &str,
    mut pending: PendingConditions,
    condition_type: &'static str,
    err: &Error,
) where
    O: Operand,
    S: ObjectStore,
{
    if matches!(err, Error::Cancelled) {
        return;
    }

    pending.set(
        condition_type,
        condition_status::FALSE,
        reasons::RECONCILE_FAILED,
        err.to_string(),
    );
    pending.set(
        condition_types::READY,
        condition_status::FALSE,
        reasons::RECONCILE_FAILED,
        format!("Failed to reconcile {}: {}", step_label(condition_type), err),
    );

    match persist_conditions::<O, S>(ctx, name, &pending).await {
        Ok(updated) => {
            if let Err(e) = publish_operand_status(ctx, &updated).await {
                warn!(kind = %O::KIND, name, error = %e, "Failed to publish operand status");
            }
        }
        Err(e) => warn!(kind = %O::KIND, name, error = %e, "Failed to record failure conditions"),
    }
}

/// Merge queued conditions into the operand status
async fn persist_conditions<O, S>(ctx: &Context<S>, name: &str, pending: &PendingConditions) -> Result<O>
where
    O: Operand,
    S: ObjectStore,
{
    ctx.status_manager()
        .update::<O, _>(None, name, |obj| {
            let generation = obj.meta().generation;
            let merged = pending.apply_to(obj.conditions().to_vec(), generation);
            *obj.conditions_mut() = merged;
        })
        .await
}

/// Operand entry derived from the operand's own conditions
pub fn operand_status_entry<O: Operand>(operand: &O) -> OperandStatus {
    let ready = find_condition(operand.conditions(), condition_types::READY);
    let is_ready = ready.is_some_and(|c| c.status == condition_status::TRUE);

    OperandStatus {
        name: operand.name_any(),
        kind: O::KIND,
        ready: if is_ready { OPERAND_READY } else { OPERAND_NOT_READY }.to_string(),
        message: ready.map(|c| c.message.clone()).unwrap_or_default(),
        conditions: operand.conditions().to_vec(),
    }
}

/// Upsert the operand's entry on the manager status
async fn publish_operand_status<O, S>(ctx: &Context<S>, operand: &O) -> Result<()>
where
    O: Operand,
    S: ObjectStore,
{
    let entry = operand_status_entry(operand);
    let result = ctx
        .status_manager()
        .update::<WorkloadIdentityManager, _>(None, SINGLETON_NAME, |manager| {
            manager
                .status
                .get_or_insert_with(Default::default)
                .upsert_operand(entry.clone());
        })
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(kind = %O::KIND, "WorkloadIdentityManager disappeared before operand status was published");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Remove the operand's entry from the manager status, if present
async fn withdraw_operand_status<O, S>(ctx: &Context<S>) -> Result<()>
where
    O: Operand,
    S: ObjectStore,
{
    let result = ctx
        .status_manager()
        .update::<WorkloadIdentityManager, _>(None, SINGLETON_NAME, |manager| {
            if let Some(status) = manager.status.as_mut() {
                status.remove_operand(O::KIND);
            }
        })
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resource class named by a `<Class>Available` condition type
fn step_label(condition_type: &str) -> &str {
    condition_type
        .strip_suffix("Available")
        .unwrap_or(condition_type)
}
