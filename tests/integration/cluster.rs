//! Cluster management for integration tests
//!
//! Uses existing kubeconfig (~/.kube/config or KUBECONFIG environment variable).

use kube::{Client, Config};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::CrdError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to create kube client: {0}")]
    ClientCreation(#[from] kube::Error),

    #[error("Failed to infer config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
}

static SHARED_CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();

static CRDS_INSTALLED: OnceCell<()> = OnceCell::const_new();

/// Connection to the cluster shared by every test in the run
pub struct SharedTestCluster {
    _marker: (),
}

impl SharedTestCluster {
    pub async fn get() -> Result<Arc<SharedTestCluster>, ClusterError> {
        SHARED_CLUSTER
            .get_or_try_init(|| async {
                let cluster = Self::connect().await?;
                Ok(Arc::new(cluster))
            })
            .await
            .map(Arc::clone)
    }

    /// Fresh client; each test runtime needs its own
    pub async fn new_client(&self) -> Result<Client, ClusterError> {
        let config = Config::infer().await?;
        Ok(Client::try_from(config)?)
    }

    async fn connect() -> Result<Self, ClusterError> {
        let config = Config::infer().await?;
        let client = Client::try_from(config)?;

        let version = client.apiserver_version().await?;
        tracing::info!(
            platform = %version.platform,
            version = %version.git_version,
            "Connected to Kubernetes cluster"
        );

        Ok(Self { _marker: () })
    }
}

/// Install the CRDs once per test run
pub async fn ensure_crds_installed(cluster: &SharedTestCluster) -> Result<(), CrdError> {
    CRDS_INSTALLED
        .get_or_try_init(|| async {
            let client = cluster.new_client().await.map_err(|e| {
                CrdError::KubeError(kube::Error::Service(
                    std::io::Error::other(e.to_string()).into(),
                ))
            })?;
            crate::install_crds(client).await
        })
        .await
        .map(|_| ())
}
