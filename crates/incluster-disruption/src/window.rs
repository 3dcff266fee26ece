//! Collection window: tell the probes to stop, then give them time to flush.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cluster::{cancellable, ClusterApi};
use crate::error::{Error, Result};

/// Default grace period between writing the stop marker and harvesting.
pub const DEFAULT_COLLECTION_GRACE: Duration = Duration::from_secs(30);

/// Writes the stop marker and waits out the grace period.
///
/// There is no acknowledgment from the probes: the grace period is an upper
/// bound guess on how long an in-flight probe needs to flush.
pub struct CollectionWindowController<'a> {
    cluster: &'a dyn ClusterApi,
    stop_signal_name: &'a str,
    grace: Duration,
}

impl<'a> CollectionWindowController<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterApi, stop_signal_name: &'a str, grace: Duration) -> Self {
        Self {
            cluster,
            stop_signal_name,
            grace,
        }
    }

    fn stop_marker(&self, namespace: &str) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(
            "stoppedAt".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.stop_signal_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        }
    }

    #[instrument(skip(self, cancel), fields(grace_secs = self.grace.as_secs()))]
    pub async fn run_window(&self, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        let marker = self.stop_marker(namespace);
        match cancellable(cancel, self.cluster.create_config_map(namespace, &marker)).await {
            Ok(()) => info!(marker = self.stop_signal_name, "Stop marker written"),
            Err(e) if e.is_already_exists() => {
                info!(marker = self.stop_signal_name, "Stop marker already present");
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(self.grace) => {
                info!("Collection grace period elapsed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn waits_full_grace_after_marker() {
        let cluster = FakeCluster::new(1, 1);
        let window = CollectionWindowController::new(&cluster, "stop-collecting", DEFAULT_COLLECTION_GRACE);

        let started = Instant::now();
        window
            .run_window("e2e-disruption-monitor-1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= DEFAULT_COLLECTION_GRACE);
        assert!(cluster.config_maps().contains(&(
            "e2e-disruption-monitor-1".to_string(),
            "stop-collecting".to_string()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_window_early() {
        let cluster = FakeCluster::new(1, 1);
        let window = CollectionWindowController::new(&cluster, "stop-collecting", DEFAULT_COLLECTION_GRACE);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = window.run_window("ns", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(cluster.config_maps().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_marker_is_tolerated() {
        let cluster = FakeCluster::new(1, 1);
        let window = CollectionWindowController::new(&cluster, "stop-collecting", Duration::from_secs(1));
        let cancel = CancellationToken::new();

        window.run_window("ns", &cancel).await.unwrap();
        window.run_window("ns", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn marker_failure_is_returned() {
        let cluster = FakeCluster::new(1, 1);
        cluster.fail("create_config_map", 403);
        let window = CollectionWindowController::new(&cluster, "stop-collecting", DEFAULT_COLLECTION_GRACE);

        let err = window
            .run_window("ns", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some(403));
    }
}
