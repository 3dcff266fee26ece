//! First-replica readiness gate for probe deployments.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};

/// Default bound on how long a probe deployment may take to roll out.
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Blocks until a deployment has at least one ready replica.
///
/// Probes are redundant (one per node), so a single ready replica is enough to
/// unblock provisioning; the rest keep rolling out in the background.
pub struct RolloutWaiter<'a> {
    cluster: &'a dyn ClusterApi,
    timeout: Duration,
}

impl<'a> RolloutWaiter<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterApi, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }

    #[instrument(skip(self, cancel), fields(timeout_secs = self.timeout.as_secs()))]
    pub async fn wait_for_ready(
        &self,
        namespace: &str,
        deployment: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut events = self.cluster.watch_deployment(namespace, deployment);

        let first_ready = async {
            while let Some(event) = events.next().await {
                let observed = match event {
                    Ok(observed) => observed,
                    Err(e) => {
                        // The API server may be the thing being disrupted.
                        warn!(deployment, error = %e, "Deployment watch error, continuing");
                        continue;
                    }
                };
                let ready = observed
                    .status
                    .as_ref()
                    .and_then(|status| status.ready_replicas)
                    .unwrap_or(0);
                debug!(deployment, ready_replicas = ready, "Observed deployment");
                if ready > 0 {
                    return Ok(());
                }
            }
            Err(Error::RolloutStream {
                deployment: deployment.to_string(),
                reason: "watch closed before any replica was ready".to_string(),
            })
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(self.timeout, first_ready) => match outcome {
                Ok(Ok(())) => {
                    info!(deployment, "✅ Deployment has a ready replica");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::RolloutTimeout {
                    deployment: deployment.to_string(),
                    timeout: self.timeout,
                }),
            },
        }
    }
}
