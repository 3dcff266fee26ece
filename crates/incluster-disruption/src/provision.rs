//! Provisioning of the probe namespace, RBAC and deployments.

use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cluster::{cancellable, ClusterApi};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::manifests::Manifests;
use crate::probe::{render_deployment, NodeCounts, ProbeDeployment, ProbeKind, Readiness};
use crate::rollout::RolloutWaiter;

/// Everything one lifecycle instance created in the cluster.
///
/// Names are recorded as soon as the corresponding create call returns, so a
/// teardown after a half-finished provisioning removes exactly what exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResources {
    pub namespace: Option<String>,
    pub cluster_role_bindings: Vec<String>,
    pub cluster_roles: Vec<String>,
    pub node_counts: NodeCounts,
    pub deployments: Vec<ProbeDeployment>,
}

impl ProvisionedResources {
    /// True when nothing is left to tear down.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespace.is_none()
            && self.cluster_role_bindings.is_empty()
            && self.cluster_roles.is_empty()
    }

    fn record_binding(&mut self, name: String) {
        if !self.cluster_role_bindings.contains(&name) {
            self.cluster_role_bindings.push(name);
        }
    }

    fn record_role(&mut self, name: String) {
        if !self.cluster_roles.contains(&name) {
            self.cluster_roles.push(name);
        }
    }

    fn set_readiness(&mut self, kind: ProbeKind, readiness: Readiness) {
        if let Some(deployment) = self.deployments.iter_mut().find(|d| d.kind == kind) {
            deployment.readiness = readiness;
        }
    }

    /// Whether every probe deployment reported a ready replica.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.deployments.len() == ProbeKind::ALL.len()
            && self
                .deployments
                .iter()
                .all(|d| d.readiness == Readiness::Ready)
    }
}

/// Extract the host part of the internal API URL.
///
/// IPv6 literals come back without brackets; the value ends up in
/// `KUBERNETES_SERVICE_HOST`, which clients join with the port themselves.
pub fn internal_api_host(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.host() {
        Some(url::Host::Ipv6(addr)) => Ok(addr.to_string()),
        Some(host) => Ok(host.to_string()),
        None => Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: "no host".to_string(),
        }),
    }
}

fn bind_to_namespace(mut binding: ClusterRoleBinding, namespace: &str) -> ClusterRoleBinding {
    if let Some(subject) = binding.subjects.as_mut().and_then(|s| s.first_mut()) {
        subject.namespace = Some(namespace.to_string());
    }
    binding
}

fn object_name(name: Option<&String>, what: &'static str) -> Result<String> {
    name.cloned()
        .ok_or_else(|| Error::Config(format!("{what} template has no metadata.name")))
}

/// Creates the probe namespace and everything inside it.
pub struct ResourceProvisioner<'a> {
    cluster: &'a dyn ClusterApi,
    manifests: &'a Manifests,
    config: &'a ProbeConfig,
}

impl<'a> ResourceProvisioner<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterApi, manifests: &'a Manifests, config: &'a ProbeConfig) -> Self {
        Self {
            cluster,
            manifests,
            config,
        }
    }

    /// Provision every probe resource and wait for each deployment's first
    /// ready replica. Stops at the first failing step.
    #[instrument(skip_all)]
    pub async fn provision(
        &self,
        image: &str,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if let Some(existing) = &resources.namespace {
            return Err(Error::AlreadyStarted(existing.clone()));
        }

        let namespace = self
            .create_namespace(cancel)
            .await
            .map_err(|e| Error::provision("creating namespace", e))?;
        resources.namespace = Some(namespace.clone());
        info!(namespace = %namespace, "Created probe namespace");

        self.create_service_account(&namespace, cancel)
            .await
            .map_err(|e| Error::provision("creating service account", e))?;

        self.create_privileged_binding(&namespace, resources, cancel)
            .await
            .map_err(|e| Error::provision("creating privileged SCC CRB", e))?;

        self.create_monitor_role(resources, cancel)
            .await
            .map_err(|e| Error::provision("creating monitor role", e))?;
        self.create_monitor_binding(&namespace, resources, cancel)
            .await
            .map_err(|e| Error::provision("creating monitor CRB", e))?;

        let counts = self
            .node_counts(cancel)
            .await
            .map_err(|e| Error::provision("counting nodes", e))?;
        resources.node_counts = counts;

        let api_host = self
            .resolve_api_host(cancel)
            .await
            .map_err(|e| Error::provision("resolving internal API host", e))?;
        info!(
            all_nodes = counts.all,
            control_plane_nodes = counts.control_plane,
            api_host = %api_host,
            "Resolved probe placement"
        );

        let waiter = RolloutWaiter::new(self.cluster, self.config.rollout_timeout());
        for kind in ProbeKind::ALL {
            let replicas = kind.replicas(counts);
            let host = (kind == ProbeKind::InternalLb).then_some(api_host.as_str());
            let deployment = render_deployment(
                self.manifests,
                self.config,
                kind,
                &namespace,
                image,
                replicas,
                host,
            )
            .map_err(|e| Error::provision("rendering deployment", e))?;
            let name = object_name(deployment.metadata.name.as_ref(), "deployment")?;

            cancellable(cancel, self.cluster.create_deployment(&namespace, &deployment))
                .await
                .map_err(|e| Error::provision("creating deployment", e))?;
            resources.deployments.push(ProbeDeployment {
                kind,
                name: name.clone(),
                replicas,
                api_host: host.map(str::to_string),
                readiness: Readiness::NotReady,
            });
            info!(deployment = %name, replicas, probe = %kind, "Created probe deployment");

            match waiter.wait_for_ready(&namespace, &name, cancel).await {
                Ok(()) => resources.set_readiness(kind, Readiness::Ready),
                Err(e) => {
                    if matches!(e, Error::RolloutTimeout { .. }) {
                        resources.set_readiness(kind, Readiness::TimedOut);
                    }
                    return Err(Error::provision("waiting for rollout", e));
                }
            }
        }

        Ok(namespace)
    }

    async fn create_namespace(&self, cancel: &CancellationToken) -> Result<String> {
        let created = cancellable(
            cancel,
            self.cluster.create_namespace(&self.manifests.namespace),
        )
        .await?;
        object_name(created.metadata.name.as_ref(), "created namespace")
    }

    async fn create_service_account(&self, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        let mut account = self.manifests.service_account.clone();
        account.metadata.namespace = Some(namespace.to_string());
        match cancellable(cancel, self.cluster.create_service_account(namespace, &account)).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    async fn create_binding(
        &self,
        template: &ClusterRoleBinding,
        namespace: &str,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let binding = bind_to_namespace(template.clone(), namespace);
        let name = object_name(binding.metadata.name.as_ref(), "cluster role binding")?;
        match cancellable(cancel, self.cluster.create_cluster_role_binding(&binding)).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                warn!(binding = %name, "Cluster role binding already exists, reusing");
            }
            Err(e) => return Err(e),
        }
        resources.record_binding(name);
        Ok(())
    }

    async fn create_privileged_binding(
        &self,
        namespace: &str,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.create_binding(&self.manifests.privileged_binding, namespace, resources, cancel)
            .await
    }

    async fn create_monitor_role(
        &self,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let role = &self.manifests.monitor_role;
        let name = object_name(role.metadata.name.as_ref(), "cluster role")?;
        match cancellable(cancel, self.cluster.create_cluster_role(role)).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                warn!(role = %name, "Cluster role already exists, reusing");
            }
            Err(e) => return Err(e),
        }
        resources.record_role(name);
        Ok(())
    }

    async fn create_monitor_binding(
        &self,
        namespace: &str,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.create_binding(&self.manifests.monitor_binding, namespace, resources, cancel)
            .await
    }

    async fn node_counts(&self, cancel: &CancellationToken) -> Result<NodeCounts> {
        let all = cancellable(cancel, self.cluster.count_nodes(None)).await?;
        let control_plane = cancellable(
            cancel,
            self.cluster
                .count_nodes(Some(self.config.control_plane_selector.as_str())),
        )
        .await?;

        if all == 0 {
            return Err(Error::NoMatchingNodes {
                selector: None,
            });
        }
        if control_plane == 0 {
            return Err(Error::NoMatchingNodes {
                selector: Some(self.config.control_plane_selector.clone()),
            });
        }

        let to_replicas = |count: usize| {
            i32::try_from(count)
                .map_err(|_| Error::Cluster(format!("node count {count} exceeds replica range")))
        };
        Ok(NodeCounts {
            all: to_replicas(all)?,
            control_plane: to_replicas(control_plane)?,
        })
    }

    async fn resolve_api_host(&self, cancel: &CancellationToken) -> Result<String> {
        let url = cancellable(cancel, self.cluster.internal_api_url())
            .await?
            .ok_or_else(|| Error::InvalidUrl {
                url: String::new(),
                reason: "infrastructure status has no apiServerInternalURI".to_string(),
            })?;
        internal_api_host(&url)
    }
}
