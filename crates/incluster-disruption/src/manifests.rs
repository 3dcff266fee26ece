//! Static resource templates for the probe namespace.
//!
//! The YAML documents ship with the crate and are parsed once into typed
//! objects; callers clone and fill in the per-instance fields.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::probe::ProbeKind;

const NAMESPACE_YAML: &str = include_str!("../manifests/namespace.yaml");
const SERVICE_ACCOUNT_YAML: &str = include_str!("../manifests/serviceaccount.yaml");
const PRIVILEGED_CRB_YAML: &str = include_str!("../manifests/crb-hostaccess.yaml");
const MONITOR_ROLE_YAML: &str = include_str!("../manifests/role-monitor.yaml");
const MONITOR_CRB_YAML: &str = include_str!("../manifests/crb-monitor.yaml");
const INTERNAL_LB_DEPLOYMENT_YAML: &str = include_str!("../manifests/dep-internal-lb.yaml");
const SERVICE_NETWORK_DEPLOYMENT_YAML: &str =
    include_str!("../manifests/dep-service-network.yaml");
const LOCALHOST_DEPLOYMENT_YAML: &str = include_str!("../manifests/dep-localhost.yaml");

/// Parsed manifest set.
#[derive(Debug, Clone)]
pub struct Manifests {
    pub namespace: Namespace,
    pub service_account: ServiceAccount,
    pub privileged_binding: ClusterRoleBinding,
    pub monitor_role: ClusterRole,
    pub monitor_binding: ClusterRoleBinding,
    pub internal_lb: Deployment,
    pub service_network: Deployment,
    pub localhost: Deployment,
}

fn parse<K: DeserializeOwned>(name: &'static str, yaml: &str) -> Result<K> {
    serde_yaml::from_str(yaml).map_err(|source| Error::Manifest { name, source })
}

impl Manifests {
    /// Parse the embedded templates.
    pub fn load() -> Result<Self> {
        Ok(Self {
            namespace: parse("namespace.yaml", NAMESPACE_YAML)?,
            service_account: parse("serviceaccount.yaml", SERVICE_ACCOUNT_YAML)?,
            privileged_binding: parse("crb-hostaccess.yaml", PRIVILEGED_CRB_YAML)?,
            monitor_role: parse("role-monitor.yaml", MONITOR_ROLE_YAML)?,
            monitor_binding: parse("crb-monitor.yaml", MONITOR_CRB_YAML)?,
            internal_lb: parse("dep-internal-lb.yaml", INTERNAL_LB_DEPLOYMENT_YAML)?,
            service_network: parse("dep-service-network.yaml", SERVICE_NETWORK_DEPLOYMENT_YAML)?,
            localhost: parse("dep-localhost.yaml", LOCALHOST_DEPLOYMENT_YAML)?,
        })
    }

    #[must_use]
    pub fn deployment(&self, kind: ProbeKind) -> &Deployment {
        match kind {
            ProbeKind::InternalLb => &self.internal_lb,
            ProbeKind::ServiceNetwork => &self.service_network,
            ProbeKind::Localhost => &self.localhost,
        }
    }
}
