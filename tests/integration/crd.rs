//! CRD installation helpers for integration tests

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use std::time::Duration;
use thiserror::Error;
use workload_identity_operator::crd::{
    SpiffeCsiDriver, SpireAgent, SpireOidcDiscoveryProvider, SpireServer, WorkloadIdentityManager,
};

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD establishment timeout: {0}")]
    EstablishmentTimeout(String),

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

/// Definitions generated from the Rust types
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        WorkloadIdentityManager::crd(),
        SpireServer::crd(),
        SpireAgent::crd(),
        SpiffeCsiDriver::crd(),
        SpireOidcDiscoveryProvider::crd(),
    ]
}

/// Server-side apply every CRD and wait until each is established
pub async fn install_crds(client: Client) -> Result<(), CrdError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("integration-test").force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;

        let establish = await_condition(crds.clone(), &name, conditions::is_crd_established());
        tokio::time::timeout(Duration::from_secs(30), establish)
            .await
            .map_err(|_| CrdError::EstablishmentTimeout(name.clone()))??;
    }

    tracing::info!("CRDs installed and established");
    Ok(())
}
