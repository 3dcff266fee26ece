//! Probe variants and the per-instance view of their deployments.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use serde::{Deserialize, Serialize};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::manifests::Manifests;

/// Probe argument naming the stop marker ConfigMap.
const STOP_CONFIGMAP_ARG: &str = "--stop-configmap=";

/// The three API server access paths exercised by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// Internal API load balancer
    InternalLb,
    /// Kubernetes service network (`kubernetes.default.svc`)
    ServiceNetwork,
    /// Host-network localhost on control-plane nodes
    Localhost,
}

impl ProbeKind {
    /// Creation order used by the provisioner.
    pub const ALL: [ProbeKind; 3] = [
        ProbeKind::ServiceNetwork,
        ProbeKind::Localhost,
        ProbeKind::InternalLb,
    ];

    /// Whether this probe is placed only on control-plane nodes.
    #[must_use]
    pub fn control_plane_only(self) -> bool {
        matches!(self, ProbeKind::Localhost)
    }

    /// Replica count for this probe given the cluster shape.
    #[must_use]
    pub fn replicas(self, counts: NodeCounts) -> i32 {
        if self.control_plane_only() {
            counts.control_plane
        } else {
            counts.all
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InternalLb => write!(f, "internal-lb"),
            Self::ServiceNetwork => write!(f, "service-network"),
            Self::Localhost => write!(f, "localhost"),
        }
    }
}

/// Node counts observed when the probes were provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeCounts {
    pub all: i32,
    pub control_plane: i32,
}

/// Observed readiness of a probe deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    NotReady,
    Ready,
    TimedOut,
}

/// One probe deployment as created for a lifecycle instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDeployment {
    pub kind: ProbeKind,
    pub name: String,
    pub replicas: i32,
    /// Resolved internal API host; only set for the internal-LB probe
    pub api_host: Option<String>,
    pub readiness: Readiness,
}

/// Render the deployment object for one probe.
///
/// The template's first container gets the probe image and the configured
/// stop marker name. The internal-LB probe additionally gets the API host in
/// its first env var; the localhost probe is pinned to the nodes matched by
/// the control-plane selector.
pub fn render_deployment(
    manifests: &Manifests,
    config: &ProbeConfig,
    kind: ProbeKind,
    namespace: &str,
    image: &str,
    replicas: i32,
    api_host: Option<&str>,
) -> Result<Deployment> {
    let mut deployment = manifests.deployment(kind).clone();
    deployment.metadata.namespace = Some(namespace.to_string());

    let invalid = |what: &str| Error::Config(format!("{kind} deployment template has no {what}"));

    let spec = deployment.spec.as_mut().ok_or_else(|| invalid("spec"))?;
    spec.replicas = Some(replicas);

    let pod = spec.template.spec.as_mut().ok_or_else(|| invalid("pod spec"))?;
    if kind.control_plane_only() {
        pod.node_selector = Some(config.control_plane_node_selector()?);
    }

    let container = pod
        .containers
        .first_mut()
        .ok_or_else(|| invalid("container"))?;
    container.image = Some(image.to_string());

    let stop_arg = format!("{STOP_CONFIGMAP_ARG}{}", config.stop_signal_name);
    let args = container.args.get_or_insert_with(Vec::new);
    match args.iter_mut().find(|arg| arg.starts_with(STOP_CONFIGMAP_ARG)) {
        Some(existing) => *existing = stop_arg,
        None => args.push(stop_arg),
    }

    if kind == ProbeKind::InternalLb {
        let host = api_host.ok_or_else(|| invalid("internal API host"))?;
        match container.env.as_mut().and_then(|env| env.first_mut()) {
            Some(first) => first.value = Some(host.to_string()),
            None => {
                container.env = Some(vec![EnvVar {
                    name: "KUBERNETES_SERVICE_HOST".to_string(),
                    value: Some(host.to_string()),
                    ..EnvVar::default()
                }]);
            }
        }
    }

    Ok(deployment)
}
