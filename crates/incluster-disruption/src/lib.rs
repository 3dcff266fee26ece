/*
 * 5D Labs Agent Platform - In-Cluster Disruption Probes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! In-cluster API server disruption probes
//!
//! Provisions short-lived poller deployments inside the cluster under test,
//! lets them record API server reachability intervals for the duration of a
//! test run, harvests those intervals and removes every trace afterwards.
//! The phases are driven through [`MonitorTest`].

pub mod cluster;
pub mod collect;
pub mod config;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod manifests;
pub mod probe;
pub mod provision;
pub mod rollout;
pub mod teardown;
pub mod window;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterApi, KubeCluster};
pub use collect::{IntervalCollector, IntervalLevel, IntervalRecord};
pub use config::ProbeConfig;
pub use error::{AggregateError, Error, Result};
pub use image::{ImagePullSpecSource, ImageSpec, StaticImage};
pub use lifecycle::{CollectedData, InClusterDisruption, MonitorTest, Phase, StartOutcome, TestReport};
pub use manifests::Manifests;
pub use probe::{render_deployment, NodeCounts, ProbeKind};
pub use provision::{ProvisionedResources, ResourceProvisioner};
pub use rollout::RolloutWaiter;
pub use teardown::TeardownController;
pub use window::CollectionWindowController;
