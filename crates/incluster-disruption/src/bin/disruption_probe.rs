/*
 * 5D Labs Agent Platform - In-Cluster Disruption Probe Runner
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

//! Disruption probe runner
//!
//! Runs the in-cluster disruption probes against the current kubeconfig
//! context for a fixed observation period:
//! - Provisions the probe namespace, RBAC and poller deployments
//! - Waits for the observation period or the first Ctrl+C / SIGTERM
//! - Signals the pollers to stop and harvests their intervals
//! - Removes everything it created
//!
//! A second signal aborts interval collection; teardown always runs.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use incluster_disruption::{
    ClusterApi, InClusterDisruption, IntervalRecord, KubeCluster, MonitorTest, ProbeConfig,
    ProvisionedResources, StartOutcome, StaticImage, TeardownController,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Parser)]
#[command(name = "disruption-probe", version, about = "In-cluster API server disruption probes")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the probes, observe, collect intervals and tear down
    Run {
        /// Observation period in seconds
        #[arg(long, default_value_t = 600)]
        duration: u64,

        /// Probe image pull spec (overrides `image` in the config file)
        #[arg(long)]
        image: Option<String>,

        /// Probe configuration file
        #[arg(long, env = "DISRUPTION_PROBE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Write intervals here as JSON lines instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove the resources of a leaked probe instance
    Cleanup {
        #[arg(long)]
        namespace: Option<String>,

        #[arg(long = "cluster-role-binding")]
        cluster_role_bindings: Vec<String>,

        #[arg(long = "cluster-role")]
        cluster_roles: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        "Starting disruption probe runner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client));
    info!("Connected to Kubernetes cluster");

    match cli.command {
        Command::Run {
            duration,
            image,
            config,
            output,
        } => {
            run(
                cluster,
                Duration::from_secs(duration),
                image,
                &config,
                output.as_deref(),
            )
            .await
        }
        Command::Cleanup {
            namespace,
            cluster_role_bindings,
            cluster_roles,
        } => {
            let mut resources = ProvisionedResources {
                namespace,
                cluster_role_bindings,
                cluster_roles,
                ..ProvisionedResources::default()
            };
            if resources.is_empty() {
                bail!("nothing to clean up: pass --namespace, --cluster-role-binding or --cluster-role");
            }
            TeardownController::new(cluster.as_ref())
                .cleanup(&mut resources, &CancellationToken::new())
                .await
                .context("cleanup incomplete")?;
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_config(config_path: &Path) -> ProbeConfig {
    let Some(path) = config_path.to_str().filter(|_| config_path.exists()) else {
        info!("No probe configuration at {}, using defaults", config_path.display());
        return ProbeConfig::default();
    };

    match ProbeConfig::from_mounted_file(path) {
        Ok(cfg) => {
            info!("Loaded probe configuration from {}", path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                path, err
            );
            ProbeConfig::default()
        }
    }
}

async fn run(
    cluster: Arc<dyn ClusterApi>,
    duration: Duration,
    image: Option<String>,
    config_path: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let Some(image) = image.or_else(|| config.image.clone()) else {
        bail!("no probe image: pass --image or set `image` in the config file");
    };

    let mut probes = InClusterDisruption::new(cluster, Arc::new(StaticImage(image)), config)
        .context("invalid probe configuration")?;

    // First signal ends observation, second aborts collection.
    let stop = CancellationToken::new();
    let abort = CancellationToken::new();
    {
        let stop = stop.clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
            shutdown_signal().await;
            warn!("Second signal received, aborting interval collection");
            abort.cancel();
        });
    }

    let begin = Utc::now();
    match probes.start_collection(&stop).await {
        Ok(StartOutcome::Started { namespace }) => {
            info!(namespace = %namespace, "Probes running");
        }
        Ok(StartOutcome::NotSupported { reason }) => {
            info!("Probes not supported on this cluster: {}", reason);
            return Ok(());
        }
        Err(err) => {
            error!("Failed to start probes: {}", err);
            if let Err(cleanup_err) = probes.cleanup(&CancellationToken::new()).await {
                error!("Cleanup after failed start incomplete: {}", cleanup_err);
            }
            return Err(err).context("failed to start probes");
        }
    }

    info!(seconds = duration.as_secs(), "Observing API server reachability");
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = stop.cancelled() => {}
    }
    let end = Utc::now();

    let collected = probes.collect_data(begin, end, &abort).await;

    // Teardown gets its own token so it still runs after an abort.
    let cleanup = probes.cleanup(&CancellationToken::new()).await;

    let data = collected.context("failed to collect intervals")?;
    write_intervals(&data.intervals, output)?;
    for report in &data.test_reports {
        match &report.failure {
            None => info!(test = %report.name, "✅ passed"),
            Some(failure) => warn!(test = %report.name, failure = %failure, "failed"),
        }
    }

    cleanup.context("failed to remove probe resources")?;
    if let Some(partial) = data.partial_failure {
        bail!("intervals missing from some probe pods: {partial}");
    }
    Ok(())
}

fn write_intervals(intervals: &[IntervalRecord], output: Option<&Path>) -> Result<()> {
    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = BufWriter::new(sink);
    for interval in intervals {
        serde_json::to_writer(&mut writer, interval)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!(intervals = intervals.len(), "Wrote collected intervals");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        },
        () = terminate => {
            info!("Received SIGTERM, stopping");
        },
    }
}
