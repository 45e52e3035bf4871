//! Print the operator's CustomResourceDefinitions as a multi-document YAML stream

use kube::CustomResourceExt;

use workload_identity_operator::crd::{
    SpiffeCsiDriver, SpireAgent, SpireOidcDiscoveryProvider, SpireServer, WorkloadIdentityManager,
};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        WorkloadIdentityManager::crd(),
        SpireServer::crd(),
        SpireAgent::crd(),
        SpiffeCsiDriver::crd(),
        SpireOidcDiscoveryProvider::crd(),
    ];

    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
