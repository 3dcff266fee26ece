//! The phase contract exposed to the test harness and its implementation
//! for the in-cluster disruption probes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cluster::{cancellable, ClusterApi};
use crate::collect::{IntervalCollector, IntervalRecord};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::image::{ImagePullSpecSource, ImageSpec};
use crate::manifests::Manifests;
use crate::provision::{ProvisionedResources, ResourceProvisioner};
use crate::teardown::TeardownController;
use crate::window::CollectionWindowController;

/// Name of the test case reporting whether every poller could be harvested.
pub const COLLECTION_TEST_NAME: &str =
    "[sig-network] in-cluster disruption pollers should report their recorded intervals";

/// Result of the start phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { namespace: String },
    /// Not an error: every later phase becomes a successful no-op
    NotSupported { reason: String },
}

/// JUnit-style test case produced by a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_out: Option<String>,
}

impl TestReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Output of the collect phase.
///
/// `partial_failure` carries the aggregate of per-pod errors; the intervals
/// from every other pod are still present.
#[derive(Debug, Default)]
pub struct CollectedData {
    pub intervals: Vec<IntervalRecord>,
    pub test_reports: Vec<TestReport>,
    pub partial_failure: Option<Error>,
}

/// Phase callbacks the harness drives, in order.
#[async_trait]
pub trait MonitorTest: Send {
    async fn start_collection(&mut self, cancel: &CancellationToken) -> Result<StartOutcome>;

    async fn collect_data(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CollectedData>;

    async fn construct_computed_intervals(
        &mut self,
        starting_intervals: &[IntervalRecord],
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntervalRecord>>;

    async fn evaluate_tests_from_constructed_intervals(
        &mut self,
        final_intervals: &[IntervalRecord],
    ) -> Result<Vec<TestReport>>;

    async fn write_content_to_storage(
        &mut self,
        storage_dir: &Path,
        time_suffix: &str,
        final_intervals: &[IntervalRecord],
    ) -> Result<()>;

    async fn cleanup(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Where a lifecycle instance is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    NotSupported(String),
    Running { namespace: String },
    StartFailed(String),
    CleanedUp,
}

/// Lifecycle of one set of in-cluster disruption probes.
///
/// All state, including the names of cluster-scoped objects, lives on the
/// instance; several instances can run side by side against different
/// clusters.
pub struct InClusterDisruption {
    cluster: Arc<dyn ClusterApi>,
    images: Arc<dyn ImagePullSpecSource>,
    config: ProbeConfig,
    manifests: Manifests,
    phase: Phase,
    resources: ProvisionedResources,
}

impl InClusterDisruption {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        images: Arc<dyn ImagePullSpecSource>,
        config: ProbeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cluster,
            images,
            config,
            manifests: Manifests::load()?,
            phase: Phase::Pending,
            resources: ProvisionedResources::default(),
        })
    }

    #[must_use]
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    #[must_use]
    pub fn resources(&self) -> &ProvisionedResources {
        &self.resources
    }

    fn not_supported(&mut self, reason: String) -> StartOutcome {
        info!(reason = %reason, "In-cluster disruption probes not supported, skipping");
        self.phase = Phase::NotSupported(reason.clone());
        StartOutcome::NotSupported { reason }
    }
}

fn collection_report(collected_pods: &[String], partial_failure: Option<&Error>) -> TestReport {
    let system_out = (!collected_pods.is_empty())
        .then(|| format!("collected intervals from: {}", collected_pods.join(", ")));
    TestReport {
        name: COLLECTION_TEST_NAME.to_string(),
        failure: partial_failure.map(ToString::to_string),
        system_out,
    }
}

#[async_trait]
impl MonitorTest for InClusterDisruption {
    #[instrument(skip_all)]
    async fn start_collection(&mut self, cancel: &CancellationToken) -> Result<StartOutcome> {
        if self.phase != Phase::Pending {
            return Err(Error::AlreadyStarted(
                self.resources.namespace.clone().unwrap_or_default(),
            ));
        }

        let image = match self.images.resolve().await? {
            ImageSpec::Available(image) => image,
            ImageSpec::NotSupported(reason) => return Ok(self.not_supported(reason)),
        };

        if cancellable(cancel, self.cluster.is_microshift()).await? {
            return Ok(self.not_supported(
                "microshift clusters don't have load balancers".to_string(),
            ));
        }

        info!(image = %image, "Starting in-cluster monitoring deployments");
        let provisioner =
            ResourceProvisioner::new(self.cluster.as_ref(), &self.manifests, &self.config);
        match provisioner
            .provision(&image, &mut self.resources, cancel)
            .await
        {
            Ok(namespace) => {
                self.phase = Phase::Running {
                    namespace: namespace.clone(),
                };
                Ok(StartOutcome::Started { namespace })
            }
            Err(e) => {
                warn!(error = %e, "In-cluster monitoring failed to start");
                self.phase = Phase::StartFailed(e.to_string());
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(begin = %begin, end = %end))]
    async fn collect_data(
        &mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CollectedData> {
        let namespace = match &self.phase {
            Phase::NotSupported(_) => return Ok(CollectedData::default()),
            Phase::Running { namespace } => namespace.clone(),
            Phase::Pending => return Err(Error::NotStarted("start was never run".to_string())),
            Phase::StartFailed(reason) => return Err(Error::NotStarted(reason.clone())),
            Phase::CleanedUp => {
                return Err(Error::NotStarted("probes were already removed".to_string()))
            }
        };

        CollectionWindowController::new(
            self.cluster.as_ref(),
            &self.config.stop_signal_name,
            self.config.collection_grace(),
        )
        .run_window(&namespace, cancel)
        .await?;

        info!("Collecting data from in-cluster monitoring deployments");
        let result = IntervalCollector::new(self.cluster.as_ref(), self.config.collection_concurrency)
            .collect(&namespace, &self.config.poller_selector, cancel)
            .await?;

        let (intervals, collected_pods, partial_failure) = result.into_parts();
        let total = intervals.len();
        let intervals: Vec<IntervalRecord> = intervals
            .into_iter()
            .filter(|interval| interval.overlaps(begin, end))
            .collect();
        if intervals.len() < total {
            info!(
                dropped = total - intervals.len(),
                "Dropped intervals outside the collection window"
            );
        }

        let report = collection_report(&collected_pods, partial_failure.as_ref());
        Ok(CollectedData {
            intervals,
            test_reports: vec![report],
            partial_failure,
        })
    }

    async fn construct_computed_intervals(
        &mut self,
        _starting_intervals: &[IntervalRecord],
        _begin: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<IntervalRecord>> {
        Ok(Vec::new())
    }

    async fn evaluate_tests_from_constructed_intervals(
        &mut self,
        _final_intervals: &[IntervalRecord],
    ) -> Result<Vec<TestReport>> {
        Ok(Vec::new())
    }

    async fn write_content_to_storage(
        &mut self,
        _storage_dir: &Path,
        _time_suffix: &str,
        _final_intervals: &[IntervalRecord],
    ) -> Result<()> {
        Ok(())
    }

    #[instrument(skip_all)]
    async fn cleanup(&mut self, cancel: &CancellationToken) -> Result<()> {
        if matches!(self.phase, Phase::NotSupported(_)) {
            return Ok(());
        }

        info!("Removing in-cluster monitoring resources");
        TeardownController::new(self.cluster.as_ref())
            .cleanup(&mut self.resources, cancel)
            .await?;
        self.phase = Phase::CleanedUp;
        Ok(())
    }
}
