//! SPIRE server resources
//!
//! The server runs as a single-replica StatefulSet with a persistent sqlite
//! datastore. When the `SpireControllerManager` gate is on, the
//! spire-controller-manager runs as a sidecar sharing the server's admin
//! socket and gets its own ConfigMap and RBAC rules.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
    VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use serde_json::json;

use crate::controller::error::Result;
use crate::controller::feature_gates::FeatureGate;
use crate::controller::operand::{Child, Operand, ReconcileStep, RenderContext};
use crate::controller::status::condition_types;
use crate::crd::{CommonConfig, OperandKind, SpireServer};
use crate::resources::common::{
    apply_scheduling, child_labels, child_meta, config_map_volume, http_probe, resource_requirements,
    selector_labels, tcp_port, volume_mount,
};

/// Name shared by the server's ServiceAccount, Service, ConfigMap and StatefulSet
pub const SERVER_NAME: &str = "spire-server";
/// ConfigMap holding the controller-manager configuration
pub const CONTROLLER_MANAGER_CONFIG_NAME: &str = "spire-controller-manager";
/// gRPC port agents connect to
pub const SERVER_PORT: i32 = 8081;
const HEALTH_PORT: i32 = 8080;
const CONTROLLER_MANAGER_HEALTH_PORT: i32 = 8083;

const CONFIG_DIR: &str = "/run/spire/config";
const DATA_DIR: &str = "/run/spire/data";
const SOCKET_DIR: &str = "/tmp/spire-server/private";
const DATA_VOLUME: &str = "spire-data";

/// Service account the agents run under; trusted by the k8s_psat attestor
pub const AGENT_SERVICE_ACCOUNT: &str = "spire-agent";

fn labels(common: &CommonConfig) -> BTreeMap<String, String> {
    child_labels(SERVER_NAME, "server", OperandKind::SpireServer.as_str(), common)
}

fn admin_socket_path() -> String {
    format!("{}/api.sock", SOCKET_DIR)
}

pub fn generate_service_account(server: &SpireServer, ctx: &RenderContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&server.spec.common), server),
        ..Default::default()
    }
}

pub fn generate_service(server: &SpireServer, ctx: &RenderContext<'_>) -> Service {
    Service {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&server.spec.common), server),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(SERVER_NAME)),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                port: SERVER_PORT,
                target_port: Some(IntOrString::String("grpc".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Cluster-wide permissions: token review for PSAT attestation, plus the
/// controller-manager's registration and webhook rules when enabled
pub fn generate_cluster_role(server: &SpireServer, ctx: &RenderContext<'_>) -> ClusterRole {
    let mut rules = vec![
        rule("authentication.k8s.io", &["tokenreviews"], &["create"]),
        rule("", &["nodes", "pods"], &["get", "list", "watch"]),
    ];

    if ctx.feature_gates.enabled(FeatureGate::SpireControllerManager) {
        rules.push(rule(
            "spire.spiffe.io",
            &["clusterfederatedtrustdomains", "clusterspiffeids", "clusterstaticentries"],
            &["get", "list", "watch", "patch", "update"],
        ));
        rules.push(rule(
            "spire.spiffe.io",
            &[
                "clusterfederatedtrustdomains/status",
                "clusterspiffeids/status",
                "clusterstaticentries/status",
            ],
            &["get", "patch", "update"],
        ));
        rules.push(rule("", &["namespaces", "endpoints"], &["get", "list", "watch"]));
        rules.push(rule(
            "admissionregistration.k8s.io",
            &["validatingwebhookconfigurations"],
            &["get", "list", "watch", "patch"],
        ));
    }

    ClusterRole {
        metadata: child_meta(SERVER_NAME, None, labels(&server.spec.common), server),
        rules: Some(rules),
        ..Default::default()
    }
}

fn server_subject(ctx: &RenderContext<'_>) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: SERVER_NAME.to_string(),
        namespace: Some(ctx.namespace().to_string()),
        ..Default::default()
    }
}

pub fn generate_cluster_role_binding(server: &SpireServer, ctx: &RenderContext<'_>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: child_meta(SERVER_NAME, None, labels(&server.spec.common), server),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: SERVER_NAME.to_string(),
        },
        subjects: Some(vec![server_subject(ctx)]),
    }
}

/// Namespaced permissions: publishing the trust bundle and leader election
pub fn generate_role(server: &SpireServer, ctx: &RenderContext<'_>) -> Role {
    Role {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&server.spec.common), server),
        rules: Some(vec![
            rule("", &["configmaps"], &["get", "list", "watch", "create", "patch", "update"]),
            rule("coordination.k8s.io", &["leases"], &["get", "list", "watch", "create", "patch", "update"]),
            rule("", &["events"], &["create"]),
        ]),
    }
}

pub fn generate_role_binding(server: &SpireServer, ctx: &RenderContext<'_>) -> RoleBinding {
    RoleBinding {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&server.spec.common), server),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: SERVER_NAME.to_string(),
        },
        subjects: Some(vec![server_subject(ctx)]),
    }
}

/// Server configuration in SPIRE's JSON form (a subset of HCL)
pub fn render_server_config(server: &SpireServer, ctx: &RenderContext<'_>) -> Result<String> {
    let spec = &server.spec;
    let manager = &ctx.manager.spec;

    let mut server_block = json!({
        "bind_address": "0.0.0.0",
        "bind_port": SERVER_PORT.to_string(),
        "socket_path": admin_socket_path(),
        "trust_domain": manager.trust_domain,
        "data_dir": DATA_DIR,
        "log_level": spec.logging.log_level.to_uppercase(),
        "log_format": spec.logging.log_format,
        "ca_ttl": format!("{}s", spec.ca_validity_seconds),
        "default_x509_svid_ttl": format!("{}s", spec.default_x509_validity_seconds),
        "default_jwt_svid_ttl": format!("{}s", spec.default_jwt_validity_seconds),
        "ca_subject": [{
            "country": ["US"],
            "organization": ["SPIFFE"],
            "common_name": "",
        }],
    });
    if let Some(issuer) = &spec.jwt_issuer {
        server_block["jwt_issuer"] = json!(issuer);
    }

    let mut psat_clusters = serde_json::Map::new();
    psat_clusters.insert(
        manager.cluster_name.clone(),
        json!({
            "service_account_allow_list": [format!("{}:{}", ctx.namespace(), AGENT_SERVICE_ACCOUNT)]
        }),
    );

    let config = json!({
        "server": server_block,
        "plugins": {
            "DataStore": [{
                "sql": {
                    "plugin_data": {
                        "database_type": "sqlite3",
                        "connection_string": format!("{}/datastore.sqlite3", DATA_DIR),
                    }
                }
            }],
            "KeyManager": [{
                "disk": { "plugin_data": { "keys_path": format!("{}/keys.json", DATA_DIR) } }
            }],
            "NodeAttestor": [{
                "k8s_psat": {
                    "plugin_data": {
                        "clusters": [psat_clusters]
                    }
                }
            }],
            "Notifier": [{
                "k8sbundle": {
                    "plugin_data": {
                        "namespace": ctx.namespace(),
                        "config_map": manager.bundle_config_map,
                    }
                }
            }],
        },
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

pub fn generate_config_map(server: &SpireServer, ctx: &RenderContext<'_>) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&server.spec.common), server),
        data: Some(BTreeMap::from([(
            "server.conf".to_string(),
            render_server_config(server, ctx)?,
        )])),
        ..Default::default()
    })
}

/// spire-controller-manager configuration (JSON is valid YAML)
pub fn render_controller_manager_config(ctx: &RenderContext<'_>) -> Result<String> {
    let manager = &ctx.manager.spec;
    let config = json!({
        "apiVersion": "spire.spiffe.io/v1alpha1",
        "kind": "ControllerManagerConfig",
        "metrics": { "bindAddress": "0.0.0.0:8082" },
        "health": { "healthProbeBindAddress": format!("0.0.0.0:{}", CONTROLLER_MANAGER_HEALTH_PORT) },
        "leaderElection": {
            "leaderElect": true,
            "resourceName": "spire-controller-manager-leader",
            "resourceNamespace": ctx.namespace(),
        },
        "clusterName": manager.cluster_name,
        "trustDomain": manager.trust_domain,
        "spireServerSocketPath": admin_socket_path(),
        "ignoreNamespaces": ["kube-system", "kube-public", ctx.namespace()],
    });
    Ok(serde_json::to_string_pretty(&config)?)
}

pub fn generate_controller_manager_config_map(
    server: &SpireServer,
    ctx: &RenderContext<'_>,
) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: child_meta(
            CONTROLLER_MANAGER_CONFIG_NAME,
            Some(ctx.namespace()),
            labels(&server.spec.common),
            server,
        ),
        data: Some(BTreeMap::from([(
            "controller-manager-config.yaml".to_string(),
            render_controller_manager_config(ctx)?,
        )])),
        ..Default::default()
    })
}

fn server_container(server: &SpireServer, ctx: &RenderContext<'_>) -> Container {
    Container {
        name: "spire-server".to_string(),
        image: Some(ctx.config.images.spire_server.clone()),
        args: Some(vec![
            "-config".to_string(),
            format!("{}/server.conf", CONFIG_DIR),
        ]),
        ports: Some(vec![tcp_port("grpc", SERVER_PORT), tcp_port("healthz", HEALTH_PORT)]),
        liveness_probe: Some(http_probe("/live", "healthz", 15, 60)),
        readiness_probe: Some(http_probe("/ready", "healthz", 5, 5)),
        resources: resource_requirements(server.spec.common.resources.as_ref()),
        volume_mounts: Some(vec![
            volume_mount("spire-config", CONFIG_DIR, true),
            volume_mount(DATA_VOLUME, DATA_DIR, false),
            volume_mount("spire-server-socket", SOCKET_DIR, false),
        ]),
        ..Default::default()
    }
}

fn controller_manager_container(ctx: &RenderContext<'_>) -> Container {
    Container {
        name: "spire-controller-manager".to_string(),
        image: Some(ctx.config.images.spire_controller_manager.clone()),
        args: Some(vec!["--config=/run/spire/controller-manager/controller-manager-config.yaml".to_string()]),
        ports: Some(vec![tcp_port("cm-healthz", CONTROLLER_MANAGER_HEALTH_PORT)]),
        liveness_probe: Some(http_probe("/healthz", "cm-healthz", 10, 10)),
        readiness_probe: Some(http_probe("/readyz", "cm-healthz", 5, 5)),
        volume_mounts: Some(vec![
            volume_mount("spire-server-socket", SOCKET_DIR, true),
            volume_mount("controller-manager-config", "/run/spire/controller-manager", true),
        ]),
        ..Default::default()
    }
}

pub fn generate_statefulset(server: &SpireServer, ctx: &RenderContext<'_>) -> StatefulSet {
    let spec = &server.spec;
    let sidecar = ctx.feature_gates.enabled(FeatureGate::SpireControllerManager);

    let mut containers = vec![server_container(server, ctx)];
    let mut volumes = vec![
        config_map_volume("spire-config", SERVER_NAME),
        Volume {
            name: "spire-server-socket".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    if sidecar {
        containers.push(controller_manager_container(ctx));
        volumes.push(config_map_volume("controller-manager-config", CONTROLLER_MANAGER_CONFIG_NAME));
    }

    let mut pod_spec = PodSpec {
        service_account_name: Some(SERVER_NAME.to_string()),
        share_process_namespace: sidecar.then_some(true),
        containers,
        volumes: Some(volumes),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, &spec.common);

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![spec.persistence.access_mode.clone()]),
            storage_class_name: spec.persistence.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.persistence.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: child_meta(SERVER_NAME, Some(ctx.namespace()), labels(&spec.common), server),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(SERVER_NAME.to_string()),
            selector: LabelSelector {
                match_labels: Some(selector_labels(SERVER_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&spec.common)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl Operand for SpireServer {
    const KIND: OperandKind = OperandKind::SpireServer;

    fn common(&self) -> &CommonConfig {
        &self.spec.common
    }

    fn steps(&self, ctx: &RenderContext<'_>) -> Result<Vec<ReconcileStep>> {
        let mut config_maps = vec![Child::ConfigMap(generate_config_map(self, ctx)?)];
        if ctx.feature_gates.enabled(FeatureGate::SpireControllerManager) {
            config_maps.push(Child::ConfigMap(generate_controller_manager_config_map(self, ctx)?));
        }

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
                    Child::Role(generate_role(self, ctx)),
                    Child::RoleBinding(generate_role_binding(self, ctx)),
                ],
            ),
            ReconcileStep::new(condition_types::CONFIG_MAP_AVAILABLE, config_maps),
            ReconcileStep::new(
                condition_types::STATEFUL_SET_AVAILABLE,
                vec![Child::StatefulSet(generate_statefulset(self, ctx))],
            ),
        ])
    }
}
