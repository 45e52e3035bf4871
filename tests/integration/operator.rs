//! Operator spawning utilities for integration tests
//!
//! Each test gets its own set of controllers bound to its operand namespace.
//! The controllers run in the test's tokio runtime and stop when the
//! [`ScopedOperator`] is dropped.

use std::sync::Arc;

use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use workload_identity_operator::controller::create_only::CreateOnlySource;
use workload_identity_operator::{
    Context, FeatureGates, KubeStore, OperatorConfig, run_aggregation_controller,
    run_oidc_discovery_provider_controller, run_spiffe_csi_driver_controller,
    run_spire_agent_controller, run_spire_server_controller,
};

/// Controllers that run for the duration of a test
pub struct ScopedOperator {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ScopedOperator {
    /// Start all five controllers with children placed in `namespace`
    pub async fn start(client: Client, namespace: &str, create_only: bool) -> Self {
        let shutdown = CancellationToken::new();
        let config = OperatorConfig {
            operand_namespace: namespace.to_string(),
            create_only: CreateOnlySource::Static(create_only),
            ..Default::default()
        };
        let ctx = Arc::new(Context::new(
            KubeStore::new(client.clone()),
            config,
            Arc::new(FeatureGates::default()),
            None,
            shutdown.clone(),
        ));

        tracing::info!(namespace, create_only, "Starting scoped operator controllers");

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            futures::join!(
                run_spire_server_controller(client.clone(), ctx.clone(), token.clone()),
                run_spire_agent_controller(client.clone(), ctx.clone(), token.clone()),
                run_spiffe_csi_driver_controller(client.clone(), ctx.clone(), token.clone()),
                run_oidc_discovery_provider_controller(client.clone(), ctx.clone(), token.clone()),
                run_aggregation_controller(client, ctx, token),
            );
            tracing::debug!("Scoped operator controllers exited");
        });

        // Give the controllers a moment to start watching
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        Self { handle, shutdown }
    }
}

impl Drop for ScopedOperator {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}
