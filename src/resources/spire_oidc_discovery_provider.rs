//! SPIRE OIDC discovery provider resources
//!
//! The provider reads the trust domain's JWT signing keys from the local
//! agent over the Workload API (mounted through the CSI driver) and serves
//! the OIDC discovery document and JWKS.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, ConfigMap, Container, PodSpec, PodTemplateSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use serde_json::json;

use crate::controller::error::Result;
use crate::controller::operand::{Child, Operand, ReconcileStep, RenderContext};
use crate::controller::status::condition_types;
use crate::crd::{CommonConfig, OperandKind, SpireOidcDiscoveryProvider};
use crate::resources::common::{
    apply_scheduling, child_labels, child_meta, config_map_volume, http_probe,
    resource_requirements, selector_labels, tcp_port, volume_mount,
};

pub const OIDC_NAME: &str = "spire-spiffe-oidc-discovery-provider";
/// CSI driver providing the Workload API socket
const WORKLOAD_API_DRIVER: &str = "csi.spiffe.io";

const SERVING_PORT: i32 = 8443;
const HEALTH_PORT: i32 = 8008;
const CONFIG_DIR: &str = "/run/spire/oidc/config";
const WORKLOAD_API_DIR: &str = "/spiffe-workload-api";

fn labels(common: &CommonConfig) -> BTreeMap<String, String> {
    child_labels(
        OIDC_NAME,
        "oidc-discovery-provider",
        OperandKind::SpireOidcDiscoveryProvider.as_str(),
        common,
    )
}

/// Host part of an issuer URL (`https://host:port/path` -> `host:port`)
pub fn issuer_host(issuer: &str) -> Option<&str> {
    let rest = issuer
        .strip_prefix("https://")
        .or_else(|| issuer.strip_prefix("http://"))
        .unwrap_or(issuer);
    let host = rest.split('/').next().unwrap_or_default();
    (!host.is_empty()).then_some(host)
}

/// Domains the provider answers for
pub fn domains(provider: &SpireOidcDiscoveryProvider, ctx: &RenderContext<'_>) -> Vec<String> {
    let ns = ctx.namespace();
    let mut domains = vec![
        OIDC_NAME.to_string(),
        format!("{}.{}", OIDC_NAME, ns),
        format!("{}.{}.svc.cluster.local", OIDC_NAME, ns),
    ];
    if let Some(host) = provider.spec.jwt_issuer.as_deref().and_then(issuer_host)
        && !domains.iter().any(|d| d == host)
    {
        domains.push(host.to_string());
    }
    domains
}

pub fn generate_service_account(
    provider: &SpireOidcDiscoveryProvider,
    ctx: &RenderContext<'_>,
) -> ServiceAccount {
    ServiceAccount {
        metadata: child_meta(OIDC_NAME, Some(ctx.namespace()), labels(&provider.spec.common), provider),
        ..Default::default()
    }
}

pub fn generate_service(provider: &SpireOidcDiscoveryProvider, ctx: &RenderContext<'_>) -> Service {
    Service {
        metadata: child_meta(OIDC_NAME, Some(ctx.namespace()), labels(&provider.spec.common), provider),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(OIDC_NAME)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::String("http".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Provider configuration in SPIRE's JSON form
pub fn render_config(provider: &SpireOidcDiscoveryProvider, ctx: &RenderContext<'_>) -> Result<String> {
    let spec = &provider.spec;
    let config = json!({
        "log_level": spec.logging.log_level.to_uppercase(),
        "domains": domains(provider, ctx),
        "allow_insecure_scheme": true,
        "insecure_addr": format!(":{}", SERVING_PORT),
        "workload_api": {
            "socket_path": format!("{}/spire-agent.sock", WORKLOAD_API_DIR),
            "trust_domain": ctx.manager.spec.trust_domain,
        },
        "health_checks": {
            "bind_port": HEALTH_PORT.to_string(),
            "live_path": "/live",
            "ready_path": "/ready",
        },
    });
    Ok(serde_json::to_string_pretty(&config)?)
}

pub fn generate_config_map(
    provider: &SpireOidcDiscoveryProvider,
    ctx: &RenderContext<'_>,
) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: child_meta(OIDC_NAME, Some(ctx.namespace()), labels(&provider.spec.common), provider),
        data: Some(BTreeMap::from([(
            "oidc-discovery-provider.conf".to_string(),
            render_config(provider, ctx)?,
        )])),
        ..Default::default()
    })
}

pub fn generate_deployment(provider: &SpireOidcDiscoveryProvider, ctx: &RenderContext<'_>) -> Deployment {
    let spec = &provider.spec;

    let container = Container {
        name: "spiffe-oidc-discovery-provider".to_string(),
        image: Some(ctx.config.images.oidc_discovery_provider.clone()),
        args: Some(vec![
            "-config".to_string(),
            format!("{}/oidc-discovery-provider.conf", CONFIG_DIR),
        ]),
        ports: Some(vec![tcp_port("http", SERVING_PORT), tcp_port("healthz", HEALTH_PORT)]),
        liveness_probe: Some(http_probe("/live", "healthz", 5, 5)),
        readiness_probe: Some(http_probe("/ready", "healthz", 5, 5)),
        resources: resource_requirements(spec.common.resources.as_ref()),
        volume_mounts: Some(vec![
            volume_mount("spiffe-workload-api", WORKLOAD_API_DIR, true),
            volume_mount("oidc-config", CONFIG_DIR, true),
        ]),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        service_account_name: Some(OIDC_NAME.to_string()),
        containers: vec![container],
        volumes: Some(vec![
            Volume {
                name: "spiffe-workload-api".to_string(),
                csi: Some(CSIVolumeSource {
                    driver: WORKLOAD_API_DRIVER.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
            config_map_volume("oidc-config", OIDC_NAME),
        ]),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, &spec.common);

    Deployment {
        metadata: child_meta(OIDC_NAME, Some(ctx.namespace()), labels(&spec.common), provider),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replica_count),
            selector: LabelSelector {
                match_labels: Some(selector_labels(OIDC_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&spec.common)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl Operand for SpireOidcDiscoveryProvider {
    const KIND: OperandKind = OperandKind::SpireOidcDiscoveryProvider;

    fn common(&self) -> &CommonConfig {
        &self.spec.common
    }

    fn steps(&self, ctx: &RenderContext<'_>) -> Result<Vec<ReconcileStep>> {
        Ok(vec![
            ReconcileStep::new(
                condition_types::SERVICE_ACCOUNT_AVAILABLE,
                vec![Child::ServiceAccount(generate_service_account(self, ctx))],
            ),
            ReconcileStep::new(
                condition_types::SERVICE_AVAILABLE,
                vec![Child::Service(generate_service(self, ctx))],
            ),
            ReconcileStep::new(
                condition_types::CONFIG_MAP_AVAILABLE,
                vec![Child::ConfigMap(generate_config_map(self, ctx)?)],
            ),
            ReconcileStep::new(
                condition_types::DEPLOYMENT_AVAILABLE,
                vec![Child::Deployment(generate_deployment(self, ctx))],
            ),
        ])
    }
}
