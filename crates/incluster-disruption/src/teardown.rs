//! Removal of everything the provisioner created.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cluster::{cancellable, ClusterApi};
use crate::error::{AggregateError, Error, Result};
use crate::provision::ProvisionedResources;

/// Treat "not found" as a successful delete.
fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Deletes the probe namespace and the cluster-scoped RBAC objects.
///
/// Every delete is attempted even when an earlier one fails; failures are
/// returned together. Successfully removed names are dropped from the
/// resource record, failed ones stay so a later call can retry them.
pub struct TeardownController<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> TeardownController<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    #[instrument(skip_all, fields(namespace = resources.namespace.as_deref().unwrap_or("")))]
    pub async fn cleanup(
        &self,
        resources: &mut ProvisionedResources,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if resources.is_empty() {
            info!("Nothing to remove");
            return Ok(());
        }

        let mut errors = Vec::new();

        if let Some(namespace) = resources.namespace.take() {
            info!(namespace = %namespace, "Removing probe namespace");
            let outcome = cancellable(cancel, self.cluster.delete_namespace(&namespace)).await;
            if let Err(e) = tolerate_missing(outcome) {
                errors.push(Error::Teardown {
                    kind: "namespace",
                    name: namespace.clone(),
                    source: Box::new(e),
                });
                resources.namespace = Some(namespace);
            } else {
                resources.deployments.clear();
            }
        }

        info!("Removing probe cluster role bindings and roles");
        let mut remaining_bindings = Vec::new();
        for name in std::mem::take(&mut resources.cluster_role_bindings) {
            let outcome = cancellable(cancel, self.cluster.delete_cluster_role_binding(&name)).await;
            if let Err(e) = tolerate_missing(outcome) {
                errors.push(Error::Teardown {
                    kind: "cluster role binding",
                    name: name.clone(),
                    source: Box::new(e),
                });
                remaining_bindings.push(name);
            }
        }
        resources.cluster_role_bindings = remaining_bindings;

        let mut remaining_roles = Vec::new();
        for name in std::mem::take(&mut resources.cluster_roles) {
            let outcome = cancellable(cancel, self.cluster.delete_cluster_role(&name)).await;
            if let Err(e) = tolerate_missing(outcome) {
                errors.push(Error::Teardown {
                    kind: "cluster role",
                    name: name.clone(),
                    source: Box::new(e),
                });
                remaining_roles.push(name);
            }
        }
        resources.cluster_roles = remaining_roles;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match AggregateError::from_errors(errors) {
            Some(aggregate) => {
                warn!(error = %aggregate, "Probe teardown incomplete");
                Err(aggregate)
            }
            None => {
                info!("✅ Probe resources removed");
                Ok(())
            }
        }
    }
}
