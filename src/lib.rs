pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod store;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, FeatureGate, FeatureGateRegistry, FeatureGates, Operand,
    Result, RetryConfig, error_policy, reconcile,
};
pub use crd::{
    SpiffeCsiDriver, SpireAgent, SpireOidcDiscoveryProvider, SpireServer, WorkloadIdentityManager,
};
pub use health::{HealthState, Metrics};
pub use store::{KubeStore, ObjectStore};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use tokio_util::sync::CancellationToken;

use crate::crd::SINGLETON_NAME;

/// Controller for one operand kind, watching the children every operand owns
///
/// Manager changes (trust domain, cluster name, bundle) re-render every
/// operand, so each controller also watches the singleton manager.
fn operand_controller<O: Operand>(client: &Client, namespace: &str) -> Controller<O> {
    let wc = WatcherConfig::default().any_semantic();

    Controller::new(Api::<O>::all(client.clone()), wc.clone())
        .owns(Api::<ServiceAccount>::namespaced(client.clone(), namespace), wc.clone())
        .watches(
            Api::<WorkloadIdentityManager>::all(client.clone()),
            wc,
            |_manager| Some(ObjectRef::<O>::new(SINGLETON_NAME)),
        )
}

/// Drive a controller until the token is cancelled
async fn drive<O: Operand>(controller: Controller<O>, ctx: Arc<Context>, shutdown: CancellationToken) {
    tracing::info!(kind = %O::KIND, "Starting operand controller");

    controller
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile::<O, KubeStore>, error_policy::<O, KubeStore>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!(kind = %O::KIND, name = %obj.name, "Reconciled");
                }
                Err(e) => {
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!(kind = %O::KIND, "Object no longer exists: {:?}", e);
                    } else {
                        tracing::error!(kind = %O::KIND, "Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::info!(kind = %O::KIND, "Operand controller stopped");
}

/// Run the SpireServer controller
pub async fn run_spire_server_controller(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let ns = ctx.config.operand_namespace.clone();
    let wc = WatcherConfig::default().any_semantic();

    let controller = operand_controller::<SpireServer>(&client, &ns)
        .owns(Api::<Service>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<ConfigMap>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<Role>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<RoleBinding>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<ClusterRole>::all(client.clone()), wc.clone())
        .owns(Api::<ClusterRoleBinding>::all(client.clone()), wc.clone())
        .owns(Api::<StatefulSet>::namespaced(client.clone(), &ns), wc);

    drive(controller, ctx, shutdown).await
}

/// Run the SpireAgent controller
pub async fn run_spire_agent_controller(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let ns = ctx.config.operand_namespace.clone();
    let wc = WatcherConfig::default().any_semantic();

    let controller = operand_controller::<SpireAgent>(&client, &ns)
        .owns(Api::<Service>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<ConfigMap>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<ClusterRole>::all(client.clone()), wc.clone())
        .owns(Api::<ClusterRoleBinding>::all(client.clone()), wc.clone())
        .owns(Api::<DaemonSet>::namespaced(client.clone(), &ns), wc);

    drive(controller, ctx, shutdown).await
}

/// Run the SpiffeCsiDriver controller
pub async fn run_spiffe_csi_driver_controller(
    client: Client,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) {
    let ns = ctx.config.operand_namespace.clone();
    let wc = WatcherConfig::default().any_semantic();

    let controller = operand_controller::<SpiffeCsiDriver>(&client, &ns)
        .owns(Api::<CSIDriver>::all(client.clone()), wc.clone())
        .owns(Api::<DaemonSet>::namespaced(client.clone(), &ns), wc);

    drive(controller, ctx, shutdown).await
}

/// Run the SpireOidcDiscoveryProvider controller
pub async fn run_oidc_discovery_provider_controller(
    client: Client,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) {
    let ns = ctx.config.operand_namespace.clone();
    let wc = WatcherConfig::default().any_semantic();

    let controller = operand_controller::<SpireOidcDiscoveryProvider>(&client, &ns)
        .owns(Api::<Service>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<ConfigMap>::namespaced(client.clone(), &ns), wc.clone())
        .owns(Api::<Deployment>::namespaced(client.clone(), &ns), wc);

    drive(controller, ctx, shutdown).await
}

/// Map any operand event onto the singleton manager
fn to_manager<K: Resource>(_operand: K) -> Option<ObjectRef<WorkloadIdentityManager>> {
    Some(ObjectRef::new(SINGLETON_NAME))
}

/// Run the aggregation controller for the WorkloadIdentityManager
///
/// Operand status changes are folded into the manager's composite
/// conditions; the manager's own status writes re-trigger it as well.
pub async fn run_aggregation_controller(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    tracing::info!("Starting aggregation controller for WorkloadIdentityManager resources");
    let wc = WatcherConfig::default().any_semantic();

    Controller::new(Api::<WorkloadIdentityManager>::all(client.clone()), wc.clone())
        .watches(Api::<SpireServer>::all(client.clone()), wc.clone(), to_manager)
        .watches(Api::<SpireAgent>::all(client.clone()), wc.clone(), to_manager)
        .watches(Api::<SpiffeCsiDriver>::all(client.clone()), wc.clone(), to_manager)
        .watches(Api::<SpireOidcDiscoveryProvider>::all(client.clone()), wc, to_manager)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(
            controller::aggregation::reconcile::<KubeStore>,
            controller::aggregation::error_policy::<KubeStore>,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => tracing::debug!(name = %obj.name, "Aggregated"),
                Err(e) => tracing::error!("Aggregation error: {:?}", e),
            }
        })
        .await;

    tracing::info!("Aggregation controller stopped");
}
