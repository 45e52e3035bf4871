//! Manager aggregation against the in-memory store

use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use kube::runtime::controller::Action;

use workload_identity_operator::controller::aggregation::{self, reasons, reconcile_manager};
use workload_identity_operator::controller::create_only::CreateOnlySource;
use workload_identity_operator::controller::error::Error;
use workload_identity_operator::controller::reconciler::reconcile_operand;
use workload_identity_operator::controller::status::{condition_status, condition_types};
use workload_identity_operator::crd::{
    HasConditions, OperandKind, OperandStatus, SINGLETON_NAME, SpiffeCsiDriver, SpireAgent,
    SpireOidcDiscoveryProvider, SpireServer, WorkloadIdentityManager,
    WorkloadIdentityManagerStatus,
};
use workload_identity_operator::health::HealthState;

use crate::common::*;

/// Manager whose status already carries the given operand entries
fn manager_with(operands: Vec<OperandStatus>) -> WorkloadIdentityManager {
    let mut manager = test_manager();
    manager.status = Some(WorkloadIdentityManagerStatus {
        conditions: Vec::new(),
        operands,
    });
    manager
}

/// Seed the manager with `operands` plus the operand resource of each entry
fn seed_operand(store: &MemoryStore, kind: OperandKind) {
    match kind {
        OperandKind::SpireServer => {
            store.seed(test_spire_server());
        }
        OperandKind::SpireAgent => {
            store.seed(test_spire_agent());
        }
        OperandKind::SpiffeCsiDriver => {
            store.seed(test_spiffe_csi_driver());
        }
        OperandKind::SpireOidcDiscoveryProvider => {
            store.seed(test_oidc_provider());
        }
    }
}

fn seed_with_operands(store: &MemoryStore, operands: Vec<OperandStatus>) {
    for entry in &operands {
        seed_operand(store, entry.kind);
    }
    store.seed(manager_with(operands));
}

fn stored_manager(store: &MemoryStore) -> WorkloadIdentityManager {
    store.fetch(None, SINGLETON_NAME).unwrap()
}

#[tokio::test]
async fn test_all_ready_operands_make_manager_ready() {
    let store = MemoryStore::new();
    seed_with_operands(
        &store,
        OperandKind::ALL
            .iter()
            .map(|kind| operand_entry(*kind, true))
            .collect(),
    );
    let ctx = test_context(store);

    let action = reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();
    assert_eq!(action, Action::await_change());

    let manager = stored_manager(&ctx.store);
    let conditions = manager.conditions();
    assert_eq!(find(conditions, condition_types::READY).status, condition_status::TRUE);
    assert_eq!(
        find(conditions, condition_types::UPGRADEABLE).status,
        condition_status::TRUE
    );
    assert_eq!(
        find(conditions, condition_types::DEGRADED).status,
        condition_status::FALSE
    );
    assert_eq!(manager.operands().len(), 4);
}

#[tokio::test]
async fn test_missing_manager_is_a_no_op() {
    let ctx = test_context(MemoryStore::new());

    let action = reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(ctx.store.total_writes(), 0);
}

#[tokio::test]
async fn test_manager_without_entries_is_vacuously_ready() {
    let store = MemoryStore::new();
    store.seed(test_manager());
    let ctx = test_context(store);

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::TRUE
    );
}

#[tokio::test]
async fn test_unready_operand_blocks_manager() {
    let store = MemoryStore::new();
    seed_with_operands(
        &store,
        vec![
            operand_entry(OperandKind::SpireServer, true),
            operand_entry(OperandKind::SpireAgent, false),
        ],
    );
    let ctx = test_context(store);

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    let ready = find(manager.conditions(), condition_types::READY);
    assert_eq!(ready.status, condition_status::FALSE);
    assert_eq!(ready.reason, reasons::OPERANDS_NOT_READY);
    assert!(ready.message.contains("SpireAgent"));
}

#[tokio::test]
async fn test_deleted_operand_no_longer_blocks_manager() {
    let store = MemoryStore::new();
    seed_with_operands(&store, vec![operand_entry(OperandKind::SpireServer, true)]);
    // SpireAgent reported unready and was deleted afterwards
    let mut manager = stored_manager(&store);
    manager
        .status
        .get_or_insert_with(Default::default)
        .upsert_operand(operand_entry(OperandKind::SpireAgent, false));
    store.seed(manager);
    let ctx = test_context(store);

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    let kinds: Vec<OperandKind> = manager.operands().iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OperandKind::SpireServer]);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::TRUE
    );
    assert_eq!(
        find(manager.conditions(), condition_types::UPGRADEABLE).status,
        condition_status::TRUE
    );
}

#[tokio::test]
async fn test_operand_lookup_error_is_returned() {
    let store = MemoryStore::new();
    seed_with_operands(&store, vec![operand_entry(OperandKind::SpireServer, true)]);
    let ctx = test_context(store);
    ctx.store
        .fail_next::<SpireServer>(Op::Get, Failure::Transient("api unavailable"), 1);

    let err = reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap_err();
    assert!(matches!(err, Error::TransientError(ref m) if m == "api unavailable"));
    assert_eq!(ctx.store.total_writes(), 0);
}

#[tokio::test]
async fn test_manager_not_named_cluster_is_ignored() {
    let store = MemoryStore::new();
    store.seed(WorkloadIdentityManager::new("other", manager_spec()));
    let ctx = test_context(store);

    let action = reconcile_manager("other", &ctx).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(ctx.store.total_writes(), 0);
    let other: WorkloadIdentityManager = ctx.store.fetch(None, "other").unwrap();
    assert!(other.conditions().is_empty());
}

#[tokio::test]
async fn test_create_only_mode_blocks_upgrades() {
    let store = MemoryStore::new();
    seed_with_operands(&store, vec![operand_entry(OperandKind::SpireServer, true)]);
    let mut ctx = test_context(store);
    ctx.config.create_only = CreateOnlySource::Static(true);

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    let upgradeable = find(manager.conditions(), condition_types::UPGRADEABLE);
    assert_eq!(upgradeable.status, condition_status::FALSE);
    assert_eq!(upgradeable.reason, reasons::CREATE_ONLY_MODE_ENABLED);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::TRUE
    );
}

#[tokio::test]
async fn test_recompute_sees_entries_published_concurrently() {
    let store = MemoryStore::new();
    seed_with_operands(&store, vec![operand_entry(OperandKind::SpireServer, false)]);
    let ctx = test_context(store);

    // The server turns ready between our read and our write
    ctx.store
        .race_next_status_write::<WorkloadIdentityManager, _>(|manager| {
            manager
                .status
                .get_or_insert_with(Default::default)
                .upsert_operand(operand_entry(OperandKind::SpireServer, true));
        });

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::TRUE
    );
    assert!(manager.operands()[0].is_ready());
}

#[tokio::test]
async fn test_repeated_aggregation_writes_once() {
    let store = MemoryStore::new();
    seed_with_operands(&store, vec![operand_entry(OperandKind::SpireAgent, true)]);
    let ctx = test_context(store);

    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();
    let first = stored_manager(&ctx.store);
    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    assert_eq!(ctx.store.writes_of::<WorkloadIdentityManager>(Op::UpdateStatus), 1);
    assert_eq!(stored_manager(&ctx.store).conditions(), first.conditions());
}

#[tokio::test]
async fn test_full_installation_becomes_ready() {
    let store = MemoryStore::new();
    store.seed(test_manager());
    store.seed(test_spire_server());
    store.seed(test_spire_agent());
    store.seed(test_spiffe_csi_driver());
    store.seed(test_oidc_provider());
    let ctx = test_context(store);

    reconcile_operand::<SpireServer, _>(SINGLETON_NAME, &ctx).await.unwrap();
    reconcile_operand::<SpireAgent, _>(SINGLETON_NAME, &ctx).await.unwrap();
    reconcile_operand::<SpiffeCsiDriver, _>(SINGLETON_NAME, &ctx).await.unwrap();
    reconcile_operand::<SpireOidcDiscoveryProvider, _>(SINGLETON_NAME, &ctx)
        .await
        .unwrap();
    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    let ready = find(manager.conditions(), condition_types::READY);
    assert_eq!(ready.status, condition_status::TRUE);
    assert_eq!(ready.reason, reasons::READY);
    assert_eq!(
        find(manager.conditions(), condition_types::DEGRADED).reason,
        reasons::AS_EXPECTED
    );
}

#[tokio::test]
async fn test_failed_operand_degrades_readiness_until_recovered() {
    let store = MemoryStore::new();
    store.seed(test_manager());
    store.seed(test_spire_agent());
    let ctx = test_context(store);

    ctx.store
        .fail_next::<DaemonSet>(Op::Create, Failure::Transient("admission denied"), 1);
    assert!(reconcile_operand::<SpireAgent, _>(SINGLETON_NAME, &ctx).await.is_err());
    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::FALSE
    );
    // A failed step is not a configuration problem
    assert_eq!(
        find(manager.conditions(), condition_types::DEGRADED).status,
        condition_status::FALSE
    );

    reconcile_operand::<SpireAgent, _>(SINGLETON_NAME, &ctx).await.unwrap();
    reconcile_manager(SINGLETON_NAME, &ctx).await.unwrap();

    let manager = stored_manager(&ctx.store);
    assert_eq!(
        find(manager.conditions(), condition_types::READY).status,
        condition_status::TRUE
    );
}

#[tokio::test]
async fn test_controller_entry_point_records_health() {
    let store = MemoryStore::new();
    store.seed(test_manager());
    let health = Arc::new(HealthState::new());
    let mut ctx = test_context(store);
    ctx.health_state = Some(health.clone());
    let ctx = Arc::new(ctx);

    aggregation::reconcile(Arc::new(test_manager()), ctx).await.unwrap();
    assert!(health.last_reconcile_secs() > 0);
}

#[tokio::test]
async fn test_error_policy_waits_after_cancellation() {
    let ctx = Arc::new(test_context(MemoryStore::new()));
    let action = aggregation::error_policy(Arc::new(test_manager()), &Error::Cancelled, ctx);
    assert_eq!(action, Action::await_change());
}
