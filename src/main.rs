use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use workload_identity_operator::controller::FeatureGateRegistry;
use workload_identity_operator::health::{HealthState, run_health_server};
use workload_identity_operator::{
    Context, KubeStore, OperatorConfig, run_aggregation_controller,
    run_oidc_discovery_provider_controller, run_spiffe_csi_driver_controller,
    run_spire_agent_controller, run_spire_server_controller,
};

/// Lease configuration
const LEASE_NAME: &str = "workload-identity-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Upper bound on waiting for controllers to drain after cancellation
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before the client is built
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("workload_identity_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting workload-identity-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let shutdown = CancellationToken::new();
    let health_state = Arc::new(HealthState::new());

    // Probes answer before leadership is acquired
    let health_handle = {
        let health_state = health_state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, shutdown).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_params = || LeaseLockParams {
        holder_id: pod_name.clone(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    };

    info!(holder_id = %pod_name, namespace = %namespace, lease_name = LEASE_NAME, "Waiting to acquire leadership...");
    let lease_lock = LeaseLock::new(client.clone(), &namespace, lease_params());
    loop {
        tokio::select! {
            result = lease_lock.try_acquire_or_renew() => match result {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    break;
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
            },
            _ = shutdown_signal() => {
                info!("Shutdown requested before leadership was acquired");
                shutdown.cancel();
                let _ = health_handle.await;
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_renewal_handle = {
        let lease_lock = LeaseLock::new(client.clone(), &namespace, lease_params());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)) => {}
                }

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership! Shutting down...");
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    let config = OperatorConfig::from_env();
    let feature_gates = FeatureGateRegistry::from_env(None).snapshot();
    info!(
        operand_namespace = %config.operand_namespace,
        gates = feature_gates.len(),
        "Loaded operator configuration"
    );

    let ctx = Arc::new(Context::new(
        KubeStore::new(client.clone()),
        config,
        feature_gates,
        Some(health_state.clone()),
        shutdown.clone(),
    ));

    let controllers = vec![
        tokio::spawn(run_spire_server_controller(client.clone(), ctx.clone(), shutdown.clone())),
        tokio::spawn(run_spire_agent_controller(client.clone(), ctx.clone(), shutdown.clone())),
        tokio::spawn(run_spiffe_csi_driver_controller(client.clone(), ctx.clone(), shutdown.clone())),
        tokio::spawn(run_oidc_discovery_provider_controller(
            client.clone(),
            ctx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(run_aggregation_controller(client.clone(), ctx, shutdown.clone())),
    ];
    health_state.set_ready(true).await;

    let all_controllers = futures::future::join_all(controllers);
    tokio::pin!(all_controllers);

    tokio::select! {
        results = &mut all_controllers => {
            for result in results {
                if let Err(e) = result {
                    error!("Controller task panicked: {}", e);
                }
            }
            error!("Controllers exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            shutdown.cancel();

            let drained = tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                &mut all_controllers,
            )
            .await;
            if drained.is_err() {
                warn!("Controllers did not stop within {}s", SHUTDOWN_GRACE_PERIOD_SECS);
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = lease_renewal_handle.await {
        error!("Lease renewal task panicked: {}", e);
    }
    if let Err(e) = health_handle.await {
        error!("Health server task panicked: {}", e);
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
