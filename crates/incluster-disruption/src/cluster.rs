//! Cluster control-plane access.
//!
//! The lifecycle components talk to the cluster only through [`ClusterApi`],
//! so they can run against [`KubeCluster`] in production and an in-memory
//! cluster in tests.

use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams,
    PostParams,
};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Namespace and name of the ConfigMap present only on MicroShift clusters.
const MICROSHIFT_VERSION_NAMESPACE: &str = "kube-public";
const MICROSHIFT_VERSION_CONFIGMAP: &str = "microshift-version";

/// Operations the probe lifecycle needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a namespace, returning the object as stored (with its generated name).
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount)
        -> Result<()>;

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<()>;

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Count nodes, optionally restricted by a label selector.
    async fn count_nodes(&self, label_selector: Option<&str>) -> Result<usize>;

    /// `status.apiServerInternalURI` of the cluster `Infrastructure` object.
    async fn internal_api_url(&self) -> Result<Option<String>>;

    /// Whether the cluster is a MicroShift single-node deployment.
    async fn is_microshift(&self) -> Result<bool>;

    /// Stream every observed state of one deployment.
    fn watch_deployment(&self, namespace: &str, name: &str) -> BoxStream<'static, Result<Deployment>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Full log of a pod's probe container.
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    async fn delete_cluster_role(&self, name: &str) -> Result<()>;
}

/// Run `operation`, returning [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

/// [`ClusterApi`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn infrastructure_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure");
        let resource = ApiResource::from_gvk(&gvk);
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), namespace).await?)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), account).await?;
        Ok(())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.create(&PostParams::default(), role).await?;
        Ok(())
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn count_nodes(&self, label_selector: Option<&str>) -> Result<usize> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(api.list(&params).await?.items.len())
    }

    async fn internal_api_url(&self) -> Result<Option<String>> {
        let infrastructure = self.infrastructure_api().get("cluster").await?;
        Ok(infrastructure
            .data
            .get("status")
            .and_then(|status| status.get("apiServerInternalURI"))
            .and_then(serde_json::Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string))
    }

    async fn is_microshift(&self) -> Result<bool> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), MICROSHIFT_VERSION_NAMESPACE);
        let marker = api.get_opt(MICROSHIFT_VERSION_CONFIGMAP).await?;
        Ok(marker.is_some())
    }

    fn watch_deployment(&self, namespace: &str, name: &str) -> BoxStream<'static, Result<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        debug!(namespace, deployment = name, "Watching deployment rollout");
        watcher(api, config)
            .default_backoff()
            .applied_objects()
            .map_err(Error::from)
            .boxed()
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.logs(pod, &LogParams::default()).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancellable_passes_through_result() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_returns_promptly_when_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
