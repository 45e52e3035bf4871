//! SPIFFE CSI driver resources
//!
//! The driver mounts the agent's Workload API socket directory into pods as
//! an ephemeral inline volume. The node-driver-registrar sidecar registers
//! the plugin socket with the kubelet.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount, VolumeMount,
};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;

use crate::controller::error::Result;
use crate::controller::feature_gates::FeatureGate;
use crate::controller::operand::{Child, Operand, ReconcileStep, RenderContext};
use crate::controller::status::condition_types;
use crate::crd::{CommonConfig, OperandKind, SpiffeCsiDriver};
use crate::resources::common::{
    apply_scheduling, child_labels, child_meta, host_path_volume, resource_requirements,
    selector_labels, volume_mount,
};

pub const CSI_DRIVER_NAME: &str = "spiffe-csi-driver";

const KUBELET_PODS_DIR: &str = "/var/lib/kubelet/pods";
const PLUGINS_REGISTRY_DIR: &str = "/var/lib/kubelet/plugins_registry";
const CSI_SOCKET_DIR: &str = "/spiffe-csi";
const AGENT_SOCKET_MOUNT: &str = "/spire-agent-socket";

fn labels(common: &CommonConfig) -> BTreeMap<String, String> {
    child_labels(CSI_DRIVER_NAME, "csi-driver", OperandKind::SpiffeCsiDriver.as_str(), common)
}

/// Host directory holding the plugin's CSI socket
fn plugin_dir(plugin_name: &str) -> String {
    format!("/var/lib/kubelet/plugins/{}", plugin_name)
}

pub fn generate_service_account(driver: &SpiffeCsiDriver, ctx: &RenderContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: child_meta(CSI_DRIVER_NAME, Some(ctx.namespace()), labels(&driver.spec.common), driver),
        ..Default::default()
    }
}

/// Cluster-scoped CSIDriver registration object
pub fn generate_csi_driver(driver: &SpiffeCsiDriver, ctx: &RenderContext<'_>) -> CSIDriver {
    let se_linux_mount = ctx
        .feature_gates
        .enabled(FeatureGate::CsiDriverSeLinuxMount)
        .then_some(true);

    CSIDriver {
        metadata: child_meta(&driver.spec.plugin_name, None, labels(&driver.spec.common), driver),
        spec: CSIDriverSpec {
            attach_required: Some(false),
            pod_info_on_mount: Some(true),
            fs_group_policy: Some("None".to_string()),
            volume_lifecycle_modes: Some(vec!["Ephemeral".to_string()]),
            se_linux_mount,
            ..Default::default()
        },
    }
}

pub fn generate_daemonset(driver: &SpiffeCsiDriver, ctx: &RenderContext<'_>) -> DaemonSet {
    let spec = &driver.spec;
    let csi_socket = format!("{}/csi.sock", CSI_SOCKET_DIR);

    let driver_container = Container {
        name: "spiffe-csi-driver".to_string(),
        image: Some(ctx.config.images.spiffe_csi_driver.clone()),
        args: Some(vec![
            format!("-workload-api-socket-dir={}", AGENT_SOCKET_MOUNT),
            format!("-plugin-name={}", spec.plugin_name),
            format!("-csi-socket-path={}", csi_socket),
        ]),
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
        security_context: Some(SecurityContext {
            privileged: Some(true),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        resources: resource_requirements(spec.common.resources.as_ref()),
        volume_mounts: Some(vec![
            volume_mount("spire-agent-socket-dir", AGENT_SOCKET_MOUNT, true),
            volume_mount("spiffe-csi-socket-dir", CSI_SOCKET_DIR, false),
            VolumeMount {
                name: "mountpoint-dir".to_string(),
                mount_path: KUBELET_PODS_DIR.to_string(),
                mount_propagation: Some("Bidirectional".to_string()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let registrar = Container {
        name: "node-driver-registrar".to_string(),
        image: Some(ctx.config.images.node_driver_registrar.clone()),
        args: Some(vec![
            format!("-csi-address={}", csi_socket),
            format!("-kubelet-registration-path={}/csi.sock", plugin_dir(&spec.plugin_name)),
            "-health-port=9809".to_string(),
        ]),
        volume_mounts: Some(vec![
            volume_mount("spiffe-csi-socket-dir", CSI_SOCKET_DIR, false),
            volume_mount("kubelet-plugin-registration-dir", "/registration", false),
        ]),
        ..Default::default()
    };

    let mut pod_spec = PodSpec {
        service_account_name: Some(CSI_DRIVER_NAME.to_string()),
        containers: vec![driver_container, registrar],
        volumes: Some(vec![
            host_path_volume("spire-agent-socket-dir", &spec.agent_socket_path, "DirectoryOrCreate"),
            host_path_volume("spiffe-csi-socket-dir", &plugin_dir(&spec.plugin_name), "DirectoryOrCreate"),
            host_path_volume("mountpoint-dir", KUBELET_PODS_DIR, "Directory"),
            host_path_volume("kubelet-plugin-registration-dir", PLUGINS_REGISTRY_DIR, "Directory"),
        ]),
        ..Default::default()
    };
    apply_scheduling(&mut pod_spec, &spec.common);

    DaemonSet {
        metadata: child_meta(CSI_DRIVER_NAME, Some(ctx.namespace()), labels(&spec.common), driver),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(CSI_DRIVER_NAME)),
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

impl Operand for SpiffeCsiDriver {
    const KIND: OperandKind = OperandKind::SpiffeCsiDriver;

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
                condition_types::CSI_DRIVER_AVAILABLE,
                vec![Child::CsiDriver(generate_csi_driver(self, ctx))],
            ),
            ReconcileStep::new(
                condition_types::DAEMON_SET_AVAILABLE,
                vec![Child::DaemonSet(generate_daemonset(self, ctx))],
            ),
        ])
    }
}
