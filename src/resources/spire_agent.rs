//! SPIRE agent resources
//!
//! The agent runs on every node as a DaemonSet. It attests to the server with
//! a projected service account token and exposes the Workload API socket in
//! a host directory shared with the CSI driver.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PodSpec, PodTemplateSpec, ProjectedVolumeSource, Service,
    ServiceAccount, ServiceAccountTokenProjection, ServicePort, ServiceSpec, Volume,
    VolumeProjection,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use serde_json::json;

use crate::controller::error::Result;
use crate::controller::operand::{Child, Operand, ReconcileStep, RenderContext};
use crate::controller::status::condition_types;
use crate::crd::{CommonConfig, OperandKind, SpireAgent};
use crate::resources::common::{
    apply_scheduling, child_labels, child_meta, config_map_volume, host_path_volume, http_probe,
    resource_requirements, selector_labels, tcp_port, volume_mount,
};
use crate::resources::spire_server::{AGENT_SERVICE_ACCOUNT, SERVER_NAME, SERVER_PORT};

pub const AGENT_NAME: &str = AGENT_SERVICE_ACCOUNT;
/// Host directory the agent publishes its Workload API socket in
pub const AGENT_SOCKET_DIR: &str = "/run/spire/agent-sockets";
/// Audience of the projected token used for node attestation
pub const PSAT_AUDIENCE: &str = "spire-server";

const HEALTH_PORT: i32 = 9982;
const CONFIG_DIR: &str = "/run/spire/config";
const BUNDLE_DIR: &str = "/run/spire/bundle";
const TOKEN_DIR: &str = "/var/run/secrets/tokens";

fn labels(common: &CommonConfig) -> BTreeMap<String, String> {
    child_labels(AGENT_NAME, "agent", OperandKind::SpireAgent.as_str(), common)
}

pub fn generate_service_account(agent: &SpireAgent, ctx: &RenderContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: child_meta(AGENT_NAME, Some(ctx.namespace()), labels(&agent.spec.common), agent),
        ..Default::default()
    }
}

/// Headless service exposing the agents' health endpoints
pub fn generate_service(agent: &SpireAgent, ctx: &RenderContext<'_>) -> Service {
    Service {
        metadata: child_meta(AGENT_NAME, Some(ctx.namespace()), labels(&agent.spec.common), agent),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(AGENT_NAME)),
            ports: Some(vec![ServicePort {
                name: Some("healthz".to_string()),
                port: HEALTH_PORT,
                target_port: Some(IntOrString::String("healthz".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read access to pods and nodes for the k8s workload attestor
pub fn generate_cluster_role(agent: &SpireAgent, _ctx: &RenderContext<'_>) -> ClusterRole {
    ClusterRole {
        metadata: child_meta(AGENT_NAME, None, labels(&agent.spec.common), agent),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string(), "nodes".to_string(), "nodes/proxy".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn generate_cluster_role_binding(agent: &SpireAgent, ctx: &RenderContext<'_>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: child_meta(AGENT_NAME, None, labels(&agent.spec.common), agent),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: AGENT_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: AGENT_NAME.to_string(),
            namespace: Some(ctx.namespace().to_string()),
            ..Default::default()
        }]),
    }
}

/// Agent configuration in SPIRE's JSON form
pub fn render_agent_config(agent: &SpireAgent, ctx: &RenderContext<'_>) -> Result<String> {
    let spec = &agent.spec;
    let manager = &ctx.manager.spec;

    let mut plugins = serde_json::Map::new();
    plugins.insert(
        "KeyManager".to_string(),
        json!([{ "memory": { "plugin_data": {} } }]),
    );
    if spec.node_attestor.k8s_psat_enabled {
        plugins.insert(
            "NodeAttestor".to_string(),
            json!([{
                "k8s_psat": {
                    "plugin_data": {
                        "cluster": manager.cluster_name,
                        "token_path": format!("{}/spire-agent", TOKEN_DIR),
                    }
                }
            }]),
        );
    }
    if spec.workload_attestors.k8s_enabled {
        plugins.insert(
            "WorkloadAttestor".to_string(),
            json!([{
                "k8s": {
                    "plugin_data": {
                        "node_name_env": "MY_NODE_NAME",
                        "disable_container_selectors": spec.workload_attestors.disable_container_selectors,
                    }
                }
            }]),
        );
    }

    let config = json!({
        "agent": {
            "data_dir": "/run/spire",
            "log_level": spec.logging.log_level.to_uppercase(),
            "log_format": spec.logging.log_format,
            "server_address": format!("{}.{}", SERVER_NAME, ctx.namespace()),
            "server_port": SERVER_PORT.to_string(),
            "socket_path": format!("{}/spire-agent.sock", AGENT_SOCKET_DIR),
            "trust_bundle_path": format!("{}/bundle.crt", BUNDLE_DIR),
            "trust_domain": manager.trust_domain,
        },
        "plugins": plugins,
        "health_checks": {
            "listener_enabled": true,
            "bind_address": "0.0.0.0",
            "bind_port": HEALTH_PORT.to_string(),
            "live_path": "/live",
            "ready_path": "/ready",
        },
    });

    Ok(serde_json::to_string_pretty(&config)?)
}

pub fn generate_config_map(agent: &SpireAgent, ctx: &RenderContext<'_>) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: child_meta(AGENT_NAME, Some(ctx.namespace()), labels(&agent.spec.common), agent),
        data: Some(BTreeMap::from([(
            "agent.conf".to_string(),
            render_agent_config(agent, ctx)?,
        )])),
        ..Default::default()
    })
}

fn token_volume() -> Volume {
    Volume {
        name: "spire-token".to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![VolumeProjection {
                service_account_token: Some(ServiceAccountTokenProjection {
                    audience: Some(PSAT_AUDIENCE.to_string()),
                    expiration_seconds: Some(7200),
                    path: "spire-agent".to_string(),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn generate_daemonset(agent: &SpireAgent, ctx: &RenderContext<'_>) -> DaemonSet {
    let spec = &agent.spec;

    let container = Container {
        name: "spire-agent".to_string(),
        image: Some(ctx.config.images.spire_agent.clone()),
        args: Some(vec!["-config".to_string(), format!("{}/agent.conf", CONFIG_DIR)]),
        env: Some(vec![k8s_openapi::api::core::v1::EnvVar {
            name: "MY_NODE_NAME".to_string(),
            value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![tcp_port("healthz", HEALTH_PORT)]),
        liveness_probe: Some(http_probe("/live", "healthz", 15, 60)),
        readiness_probe: Some(http_probe("/ready", "healthz", 10, 30)),
        resources: resource_requirements(spec.common.resources.as_ref()),
        volume_mounts: Some(vec![
            volume_mount("spire-config", CONFIG_DIR, true),
            volume_mount("spire-bundle", BUNDLE_DIR, true),
            volume_mount("spire-agent-socket-dir", AGENT_SOCKET_DIR, false),
            volume_mount("spire-token", TOKEN_DIR, true),
        ]),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        service_account_name: Some(AGENT_NAME.to_string()),
        host_pid: Some(true),
        host_network: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        containers: vec![container],
        volumes: Some(vec![
            config_map_volume("spire-config", AGENT_NAME),
            config_map_volume("spire-bundle", &ctx.manager.spec.bundle_config_map),
            host_path_volume("spire-agent-socket-dir", AGENT_SOCKET_DIR, "DirectoryOrCreate"),
            token_volume(),
        ]),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, &spec.common);

    DaemonSet {
        metadata: child_meta(AGENT_NAME, Some(ctx.namespace()), labels(&spec.common), agent),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(AGENT_NAME)),
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

impl Operand for SpireAgent {
    const KIND: OperandKind = OperandKind::SpireAgent;

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
                condition_types::RBAC_AVAILABLE,
                vec![
                    Child::ClusterRole(generate_cluster_role(self, ctx)),
                    Child::ClusterRoleBinding(generate_cluster_role_binding(self, ctx)),
                ],
            ),
            ReconcileStep::new(
                condition_types::CONFIG_MAP_AVAILABLE,
                vec![Child::ConfigMap(generate_config_map(self, ctx)?)],
            ),
            ReconcileStep::new(
                condition_types::DAEMON_SET_AVAILABLE,
                vec![Child::DaemonSet(generate_daemonset(self, ctx))],
            ),
        ])
    }
}
