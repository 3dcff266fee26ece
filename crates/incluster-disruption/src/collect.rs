//! Harvesting recorded intervals from probe pods.
//!
//! Each probe writes one JSON interval per line to its container log. Pods are
//! read concurrently and independently: a pod that cannot be read is reported
//! in the aggregate error, and every other pod's intervals are kept.

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{cancellable, ClusterApi};
use crate::error::{AggregateError, Error, Result};

/// Severity of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalLevel {
    Info,
    Warning,
    Error,
    #[serde(other)]
    Unknown,
}

/// One reachability observation emitted by a probe.
///
/// `locator` and `message` are opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalRecord {
    pub level: IntervalLevel,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub locator: serde_json::Value,
    #[serde(default)]
    pub message: serde_json::Value,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Probe pod that recorded the interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
}

impl IntervalRecord {
    /// Whether the interval overlaps `[begin, end]`.
    #[must_use]
    pub fn overlaps(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.from <= end && self.to >= begin
    }
}

/// Parse interval lines out of a probe log, tagging each with `pod`.
///
/// Lines that are not JSON objects are ordinary log output and are skipped.
#[must_use]
pub fn parse_intervals(pod: &str, log: &str) -> Vec<IntervalRecord> {
    log.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<IntervalRecord>(line) {
            Ok(mut interval) => {
                interval.pod = Some(pod.to_string());
                Some(interval)
            }
            Err(e) => {
                warn!(pod, error = %e, "Skipping malformed interval line");
                None
            }
        })
        .collect()
}

/// Outcome of one harvest.
#[derive(Debug, Default)]
pub struct CollectionResult {
    pub intervals: Vec<IntervalRecord>,
    /// Pods whose intervals were read
    pub collected_pods: Vec<String>,
    /// One [`Error::PodCollection`] per pod that could not be read
    pub failures: Vec<Error>,
}

impl CollectionResult {
    #[must_use]
    pub fn failed_pods(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|failure| match failure {
                Error::PodCollection { pod, .. } => Some(pod.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Split into the intervals and the aggregate of per-pod failures.
    #[must_use]
    pub fn into_parts(self) -> (Vec<IntervalRecord>, Vec<String>, Option<Error>) {
        (
            self.intervals,
            self.collected_pods,
            AggregateError::from_errors(self.failures),
        )
    }
}

/// Reads intervals from every probe pod in a namespace.
pub struct IntervalCollector<'a> {
    cluster: &'a dyn ClusterApi,
    concurrency: usize,
}

impl<'a> IntervalCollector<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn ClusterApi, concurrency: usize) -> Self {
        Self {
            cluster,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip(self, cancel))]
    pub async fn collect(
        &self,
        namespace: &str,
        label_selector: &str,
        cancel: &CancellationToken,
    ) -> Result<CollectionResult> {
        let pods = cancellable(cancel, self.cluster.list_pods(namespace, label_selector)).await?;
        let names: Vec<String> = pods
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();
        info!(pods = names.len(), "Collecting intervals from probe pods");

        let mut outcomes: Vec<(String, Result<Vec<IntervalRecord>>)> = stream::iter(names)
            .map(|pod| async move {
                let outcome = cancellable(cancel, self.cluster.pod_logs(namespace, &pod))
                    .await
                    .map(|log| parse_intervals(&pod, &log));
                (pod, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        outcomes.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut result = CollectionResult::default();
        for (pod, outcome) in outcomes {
            match outcome {
                Ok(intervals) => {
                    debug!(pod = %pod, intervals = intervals.len(), "Collected pod intervals");
                    result.intervals.extend(intervals);
                    result.collected_pods.push(pod);
                }
                Err(e) => {
                    warn!(pod = %pod, error = %e, "Failed to collect pod intervals");
                    result.failures.push(Error::PodCollection {
                        pod,
                        source: Box::new(e),
                    });
                }
            }
        }
        result.intervals.sort_by_key(|interval| interval.from);

        info!(
            intervals = result.intervals.len(),
            failed_pods = result.failures.len(),
            "Interval collection finished"
        );
        Ok(result)
    }
}
