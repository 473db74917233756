// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! The harvester service: stores freshly created plots across one or more local disks.
//!
//! Placement is decided without a coordinator. Every harvester hears each placement broadcast,
//! picks its own best storage path, and delays its reply by a "taint" proportional to its
//! current load and disk fullness. The plotter takes the first reply, so the globally preferred
//! harvester usually wins the race implicitly.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use garden_bus::{
    PlotLocateReply, PlotLocateRequest, PlotReadyReply, PlotReadyRequest, PlotService,
};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use crate::common::{telemetry, utils};

pub mod config;
mod metrics;
pub mod plot_paths;
pub mod server;

use config::HarvesterConfig;
use metrics::HarvesterMetricSet;
use plot_paths::PlotPaths;
use server::TransferServer;

/// Reply delay applied per in-flight transfer; prefers harvesters with less busy networks.
pub(crate) const TAINT_PER_TRANSFER: Duration = Duration::from_millis(25);

/// Reply delay applied at 100% disk usage, scaled by the used fraction; prefers emptier disks.
pub(crate) const TAINT_FULL_DISK: Duration = Duration::from_millis(20);

/// The harvester node: the storage-path registry, the in-flight transfer counter, and the
/// identity advertised in placement replies.
#[derive(Debug)]
pub struct Harvester {
    pub(crate) paths: PlotPaths,
    pub(crate) hostname: String,
    pub(crate) host_port: String,
    pub(crate) max_transfers: usize,
    pub(crate) transfers: AtomicUsize,
    pub(crate) metrics: HarvesterMetricSet,
    pub(crate) started_at: Instant,
}

impl Harvester {
    /// Validates the configured storage paths and creates the node.
    pub fn new(config: &HarvesterConfig, registry: &Registry) -> anyhow::Result<Arc<Self>> {
        let paths = PlotPaths::open(&config.paths, &config.expand_paths)?;
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        let host_port = format!("{}:{}", config.http_ip, config.http_port);
        tracing::info!(
            paths = paths.len(),
            "using http://{host_port} for transfers"
        );

        Ok(Arc::new(Self {
            paths,
            hostname,
            host_port,
            max_transfers: config.max_transfers,
            transfers: AtomicUsize::new(0),
            metrics: HarvesterMetricSet::new(registry),
            started_at: Instant::now(),
        }))
    }

    /// Creates a node over pre-built storage paths, without touching the filesystem.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(paths: PlotPaths, max_transfers: usize) -> Arc<Self> {
        Arc::new(Self {
            paths,
            hostname: "test-harvester".to_owned(),
            host_port: "127.0.0.1:0".to_owned(),
            max_transfers,
            transfers: AtomicUsize::new(0),
            metrics: HarvesterMetricSet::new(&Registry::new()),
            started_at: Instant::now(),
        })
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.transfers.load(Ordering::Relaxed)
    }
}

/// Computes how long to delay a placement reply based on current pressure.
///
/// Deterministic in its inputs and monotonically non-decreasing in both the number of in-flight
/// transfers and the used fraction of the chosen disk, so that more loaded harvesters always
/// wait at least as long as less loaded ones.
pub(crate) fn taint(in_flight: usize, free_space: u64, total_space: u64) -> Duration {
    let transfer_term =
        TAINT_PER_TRANSFER * u32::try_from(in_flight).unwrap_or(u32::MAX);

    let used_fraction = if total_space == 0 {
        0.0
    } else {
        total_space.saturating_sub(free_space) as f64 / total_space as f64
    };
    let space_term = TAINT_FULL_DISK.mul_f64(used_fraction);

    transfer_term + space_term
}

#[async_trait]
impl PlotService for Harvester {
    /// Processes a placement request from a plotter.
    ///
    /// Declines silently when the best path cannot hold the plot; sleeps the taint before
    /// answering otherwise. The chosen path is not re-checked after the sleep: if it became
    /// busy in the meantime the receiver answers 503 and the plotter re-races immediately.
    async fn plot_ready(
        &self,
        request: PlotReadyRequest,
    ) -> Result<Option<PlotReadyReply>, anyhow::Error> {
        let Some(path) = self.paths.select_best() else {
            bail!("no paths available");
        };

        if path.free_space() <= request.size {
            tracing::debug!(
                name = %request.name,
                size = request.size,
                "declining plot, insufficient space"
            );
            return Ok(None);
        }

        let store = path.path().display().to_string();
        let reply = PlotReadyReply {
            hostname: self.hostname.clone(),
            url: format!("http://{}{}/{}", self.host_port, store, request.name),
            store,
        };

        let delay = taint(self.in_flight(), path.free_space(), path.total_space());
        tokio::time::sleep(delay).await;
        Ok(Some(reply))
    }

    /// Reports whether any storage path holds a plot of the requested name and size.
    ///
    /// Used by plotters at startup to reconcile leftover local files. Declining (rather than
    /// replying "not here") lets the plotter treat a bus timeout as "absent everywhere".
    async fn plot_locate(
        &self,
        request: PlotLocateRequest,
    ) -> Result<Option<PlotLocateReply>, anyhow::Error> {
        for path in self.paths.iter() {
            let candidate = path.path().join(&request.name);
            let metadata = match tokio::fs::metadata(&candidate).await {
                Ok(metadata) => metadata,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => {
                    tracing::warn!(%error, path = %candidate.display(), "error checking for plot");
                    continue;
                }
            };

            if metadata.len() == request.size {
                return Ok(Some(PlotLocateReply {
                    hostname: self.hostname.clone(),
                }));
            }

            tracing::warn!(
                path = %candidate.display(),
                expected = request.size,
                actual = metadata.len(),
                "plot found with mismatched size, check the validity of the file"
            );
        }
        Ok(None)
    }
}

/// Runs a harvester until the process is told to shut down.
pub async fn run(config: HarvesterConfig) -> anyhow::Result<()> {
    let registry = Registry::new();
    let harvester = Harvester::new(&config, &registry)?;

    let client = async_nats::connect(config.nats_url.as_str())
        .await
        .context("failed to connect to the bus")?;

    let cancel_token = CancellationToken::new();
    telemetry::start_metrics_server(config.metrics_address, registry, cancel_token.child_token());

    let bus_task = tokio::spawn(garden_bus::serve(
        client.clone(),
        harvester.clone(),
        cancel_token.child_token(),
    ));

    let bind_address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind the transfer endpoint on {bind_address}"))?;
    let server = TransferServer::new(harvester, cancel_token.child_token());
    let server_task = tokio::spawn(server.serve_on(listener));

    tracing::info!("harvester ready");
    utils::wait_for_shutdown_signal().await?;

    tracing::info!("shutting down, draining in-flight transfers");
    cancel_token.cancel();
    server_task
        .await
        .context("transfer server task panicked")?
        .context("transfer server failed")?;
    bus_task.await.context("bus listener task panicked")??;
    Ok(())
}
