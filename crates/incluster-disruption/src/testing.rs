//! In-memory cluster used by unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::core::ObjectMeta;

use crate::cluster::ClusterApi;
use crate::error::{api_error, Error, Result};

/// How a fake deployment reports readiness once watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollout {
    /// First observed state already has a ready replica
    Immediate,
    /// Never becomes ready; the watch stays open
    Never,
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    service_accounts: BTreeSet<(String, String)>,
    cluster_roles: BTreeSet<String>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    deployments: BTreeMap<String, Deployment>,
    config_maps: BTreeSet<(String, String)>,
    generated: usize,
    calls: Vec<String>,
    failures: HashMap<String, u16>,
    scripted_watches: HashMap<String, mpsc::UnboundedReceiver<Result<Deployment>>>,
}

pub struct FakeCluster {
    state: Mutex<State>,
    nodes: usize,
    control_plane_nodes: usize,
    internal_api_url: Option<String>,
    microshift: bool,
    rollout: Rollout,
    pods: Vec<(String, std::result::Result<String, u16>)>,
}

impl FakeCluster {
    pub fn new(nodes: usize, control_plane_nodes: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            nodes,
            control_plane_nodes,
            internal_api_url: Some("https://api-int.ci.example.com:6443".to_string()),
            microshift: false,
            rollout: Rollout::Immediate,
            pods: Vec::new(),
        }
    }

    pub fn with_rollout(mut self, rollout: Rollout) -> Self {
        self.rollout = rollout;
        self
    }

    pub fn with_internal_api_url(mut self, url: Option<&str>) -> Self {
        self.internal_api_url = url.map(str::to_string);
        self
    }

    pub fn with_microshift(mut self) -> Self {
        self.microshift = true;
        self
    }

    /// Add a probe pod whose log is `log`.
    pub fn with_pod(mut self, name: &str, log: &str) -> Self {
        self.pods.push((name.to_string(), Ok(log.to_string())));
        self
    }

    /// Add a probe pod whose log read fails with the given status code.
    pub fn with_unreachable_pod(mut self, name: &str, code: u16) -> Self {
        self.pods.push((name.to_string(), Err(code)));
        self
    }

    /// Make every call to `operation` fail with `code`.
    pub fn fail(&self, operation: &str, code: u16) {
        self.state()
            .failures
            .insert(operation.to_string(), code);
    }

    /// Drive the watch of deployment `name` by hand.
    pub fn script_watch(&self, name: &str) -> mpsc::UnboundedSender<Result<Deployment>> {
        let (tx, rx) = mpsc::unbounded();
        self.state().scripted_watches.insert(name.to_string(), rx);
        tx
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state().namespaces.clone()
    }

    pub fn cluster_roles(&self) -> BTreeSet<String> {
        self.state().cluster_roles.clone()
    }

    pub fn cluster_role_bindings(&self) -> BTreeMap<String, ClusterRoleBinding> {
        self.state().cluster_role_bindings.clone()
    }

    pub fn deployments(&self) -> BTreeMap<String, Deployment> {
        self.state().deployments.clone()
    }

    pub fn config_maps(&self) -> BTreeSet<(String, String)> {
        self.state().config_maps.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn replicas(&self, deployment: &str) -> Option<i32> {
        self.state()
            .deployments
            .get(deployment)
            .and_then(|d| d.spec.as_ref())
            .and_then(|spec| spec.replicas)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn enter(&self, operation: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        match state.failures.get(operation) {
            Some(code) => Err(api_error(*code, "Injected")),
            None => Ok(()),
        }
    }
}

pub fn ready_deployment(name: &str, ready_replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        status: Some(DeploymentStatus {
            ready_replicas: Some(ready_replicas),
            ..DeploymentStatus::default()
        }),
        ..Deployment::default()
    }
}

fn conflict_if(exists: bool) -> Result<()> {
    if exists {
        Err(api_error(409, "AlreadyExists"))
    } else {
        Ok(())
    }
}

fn missing_unless(existed: bool) -> Result<()> {
    if existed {
        Ok(())
    } else {
        Err(api_error(404, "NotFound"))
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.enter("create_namespace")?;
        let mut state = self.state();
        let name = match (&namespace.metadata.name, &namespace.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => {
                state.generated += 1;
                format!("{prefix}{:05}", state.generated)
            }
            (None, None) => return Err(Error::Config("namespace without a name".into())),
        };
        conflict_if(!state.namespaces.insert(name.clone()))?;
        let mut created = namespace.clone();
        created.metadata.name = Some(name);
        Ok(created)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<()> {
        self.enter("create_service_account")?;
        let key = (
            namespace.to_string(),
            account.metadata.name.clone().unwrap_or_default(),
        );
        conflict_if(!self.state().service_accounts.insert(key))
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        self.enter("create_cluster_role")?;
        let name = role.metadata.name.clone().unwrap_or_default();
        conflict_if(!self.state().cluster_roles.insert(name))
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        self.enter("create_cluster_role_binding")?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        let mut state = self.state();
        conflict_if(state.cluster_role_bindings.contains_key(&name))?;
        state.cluster_role_bindings.insert(name, binding.clone());
        Ok(())
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        self.enter("create_deployment")?;
        let mut state = self.state();
        if !state.namespaces.contains(namespace) {
            return Err(api_error(404, "NotFound"));
        }
        let name = deployment.metadata.name.clone().unwrap_or_default();
        conflict_if(state.deployments.contains_key(&name))?;
        state.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        self.enter("create_config_map")?;
        let key = (
            namespace.to_string(),
            config_map.metadata.name.clone().unwrap_or_default(),
        );
        conflict_if(!self.state().config_maps.insert(key))
    }

    async fn count_nodes(&self, label_selector: Option<&str>) -> Result<usize> {
        self.enter("count_nodes")?;
        Ok(match label_selector {
            Some(_) => self.control_plane_nodes,
            None => self.nodes,
        })
    }

    async fn internal_api_url(&self) -> Result<Option<String>> {
        self.enter("internal_api_url")?;
        Ok(self.internal_api_url.clone())
    }

    async fn is_microshift(&self) -> Result<bool> {
        self.enter("is_microshift")?;
        Ok(self.microshift)
    }

    fn watch_deployment(&self, _namespace: &str, name: &str) -> BoxStream<'static, Result<Deployment>> {
        if let Some(scripted) = self.state().scripted_watches.remove(name) {
            return scripted.boxed();
        }
        let first = match self.rollout {
            Rollout::Immediate => ready_deployment(name, 1),
            Rollout::Never => ready_deployment(name, 0),
        };
        stream::iter(vec![Ok(first)])
            .chain(stream::pending())
            .boxed()
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        self.enter("list_pods")?;
        Ok(self
            .pods
            .iter()
            .map(|(name, _)| Pod {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..ObjectMeta::default()
                },
                ..Pod::default()
            })
            .collect())
    }

    async fn pod_logs(&self, _namespace: &str, pod: &str) -> Result<String> {
        self.enter("pod_logs")?;
        match self.pods.iter().find(|(name, _)| name == pod) {
            Some((_, Ok(log))) => Ok(log.clone()),
            Some((_, Err(code))) => Err(api_error(*code, "ServiceUnavailable")),
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.enter("delete_namespace")?;
        let mut state = self.state();
        let existed = state.namespaces.remove(name);
        if existed {
            state.deployments.clear();
            state.config_maps.retain(|(namespace, _)| namespace != name);
            state.service_accounts.retain(|(namespace, _)| namespace != name);
        }
        missing_unless(existed)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        self.enter("delete_cluster_role_binding")?;
        missing_unless(self.state().cluster_role_bindings.remove(name).is_some())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        self.enter("delete_cluster_role")?;
        missing_unless(self.state().cluster_roles.remove(name))
    }
}
