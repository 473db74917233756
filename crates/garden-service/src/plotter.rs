// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! The plotter service: discovers freshly produced plots and offloads them to harvesters.
//!
//! A filesystem watcher feeds newly created plot files into a bounded queue consumed by a fixed
//! pool of transfer workers. At startup, files left over from a previous run are reconciled
//! against the cluster: anything a harvester already stores is deleted locally, everything else
//! is queued for transfer.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context as _};
use garden_bus::{BusClient, PlotLocateRequest};
use prometheus::Registry;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::common::{telemetry, utils};

pub mod config;
mod metrics;
pub mod transfer;
mod watcher;

use config::PlotterConfig;
use metrics::PlotterMetricSet;

/// Capacity of the pending-plot queue shared by the watcher and the workers.
pub(crate) const PLOT_QUEUE_CAPACITY: usize = 1024;

/// State shared by all transfer workers of a plotter.
#[derive(Debug)]
pub struct Plotter {
    pub(crate) bus: BusClient,
    pub(crate) http: reqwest::Client,
    pub(crate) metrics: PlotterMetricSet,
    failed_plots: std::sync::Mutex<Vec<PathBuf>>,
}

impl Plotter {
    pub(crate) fn new(bus: BusClient, registry: &Registry) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            bus,
            http: reqwest::Client::builder()
                .build()
                .context("failed to build the transfer client")?,
            metrics: PlotterMetricSet::new(registry),
            failed_plots: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn record_failed(&self, plot: PathBuf) {
        let mut failed = self
            .failed_plots
            .lock()
            .expect("failed-plots mutex is never poisoned");
        failed.push(plot);
        self.metrics.failed_plots.set(failed.len() as i64);
    }

    /// Plots that exhausted their transfer attempts since startup.
    pub fn failed_plots(&self) -> Vec<PathBuf> {
        self.failed_plots
            .lock()
            .expect("failed-plots mutex is never poisoned")
            .clone()
    }
}

/// Reconciles plot files that already existed at startup.
///
/// A plot some harvester already stores is deleted locally; one that nobody has is queued for
/// transfer. Any other locate failure leaves the file alone for the next restart.
async fn reconcile_existing(
    plotter: Arc<Plotter>,
    existing: Vec<PathBuf>,
    queue: mpsc::Sender<PathBuf>,
) {
    for plot in existing {
        let metadata = match tokio::fs::metadata(&plot).await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!(
                    %error,
                    plot = %plot.display(),
                    "failed to check info on plot, removing and continuing"
                );
                let _ = tokio::fs::remove_file(&plot).await;
                continue;
            }
        };
        let Some(name) = plot.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let request = PlotLocateRequest {
            name: name.to_owned(),
            size: metadata.len(),
        };

        match plotter.bus.plot_locate(&request).await {
            Ok(Some(reply)) => {
                tracing::info!(
                    plot = %plot.display(),
                    host = %reply.hostname,
                    "plot already exists, cleaning up"
                );
                if let Err(error) = tokio::fs::remove_file(&plot).await {
                    tracing::warn!(%error, plot = %plot.display(), "failed to remove local plot");
                }
            }
            Ok(None) => {
                tracing::info!(plot = %plot.display(), "plot not on any harvester, queuing to send");
                if queue.send(plot).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                tracing::warn!(%error, plot = %plot.display(), "locate request failed, skipping");
            }
        }
    }
}

/// Runs a plotter until the process is told to shut down.
pub async fn run(config: PlotterConfig) -> anyhow::Result<()> {
    if config.max_transfers == 0 {
        bail!("at least one transfer worker is required");
    }
    // Listing up front also validates every watch directory before anything is spawned.
    let existing = watcher::existing_plots(&config.watch_paths, &config.suffix)?;

    let client = async_nats::connect(config.nats_url.as_str())
        .await
        .context("failed to connect to the bus")?;
    let registry = Registry::new();
    let plotter = Plotter::new(BusClient::new(client), &registry)?;

    let cancel_token = CancellationToken::new();
    telemetry::start_metrics_server(config.metrics_address, registry, cancel_token.child_token());

    let (queue, receiver) = mpsc::channel(PLOT_QUEUE_CAPACITY);
    let receiver = Arc::new(Mutex::new(receiver));
    for _ in 0..config.max_transfers {
        tokio::spawn(transfer::run_worker(
            plotter.clone(),
            receiver.clone(),
            queue.clone(),
            cancel_token.child_token(),
        ));
    }

    let _watcher = watcher::PlotWatcher::start(&config.watch_paths, &config.suffix, queue.clone())?;
    let reconciliation = tokio::spawn(reconcile_existing(plotter.clone(), existing, queue));

    tracing::info!(
        watched = config.watch_paths.len(),
        workers = config.max_transfers,
        "plotter ready"
    );
    utils::wait_for_shutdown_signal().await?;

    // In-flight transfers finish naturally; whatever is still queued is rediscovered by the
    // next startup's reconciliation.
    tracing::info!("shutting down");
    cancel_token.cancel();
    reconciliation.abort();
    Ok(())
}
