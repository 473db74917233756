// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Garden entry point.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use garden_service::{
    common::{config::DEFAULT_NATS_URL, telemetry, utils},
    harvester::{self, config::HarvesterConfig},
    plotter::{self, config::PlotterConfig},
};

/// Transfer freshly created plots from plotter machines to harvester machines, balancing
/// storage across the cluster's nodes and disks.
#[derive(Debug, Parser)]
#[clap(rename_all = "kebab-case", name = env!("CARGO_BIN_NAME"), version)]
struct Args {
    /// URL of the NATS server connecting plotters and harvesters.
    #[clap(
        long = "nats",
        short = 'n',
        global = true,
        env = "GARDEN_NATS_URL",
        default_value = DEFAULT_NATS_URL
    )]
    nats_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Receive new plots on a harvester, storing them across the local disks.
    Harvester(HarvesterArgs),

    /// Watch for new plots on a plotter and transport them to harvesters.
    Plotter(PlotterArgs),
}

#[derive(Debug, Clone, clap::Args)]
struct HarvesterArgs {
    /// Directory in which to store plots. May be repeated.
    #[clap(
        long = "path",
        short = 'p',
        env = "GARDEN_HARVESTER_PATHS",
        value_delimiter = ','
    )]
    paths: Vec<PathBuf>,

    /// Directory whose immediate subdirectories all store plots. May be repeated.
    #[clap(
        long = "expand-path",
        short = 'x',
        env = "GARDEN_HARVESTER_EXPAND_PATHS",
        value_delimiter = ','
    )]
    expand_paths: Vec<PathBuf>,

    /// Maximum number of concurrent inbound transfers.
    #[clap(
        long,
        short = 't',
        env = "GARDEN_HARVESTER_MAX_TRANSFERS",
        default_value_t = harvester::config::defaults::MAX_TRANSFERS
    )]
    max_transfers: usize,

    /// IP address advertised to plotters for transfers (mainly needed behind NAT or in
    /// containers) [default: the address of the default network interface].
    #[clap(long, env = "GARDEN_HARVESTER_HTTP_IP")]
    http_ip: Option<IpAddr>,

    /// Port on which plot transfers are accepted.
    #[clap(
        long,
        env = "GARDEN_HARVESTER_HTTP_PORT",
        default_value_t = harvester::config::defaults::HTTP_PORT
    )]
    http_port: u16,

    /// Socket address on which Prometheus metrics are exported.
    #[clap(
        long,
        env = "GARDEN_HARVESTER_METRICS_ADDRESS",
        default_value_t = harvester::config::defaults::metrics_address()
    )]
    metrics_address: SocketAddr,
}

#[derive(Debug, Clone, clap::Args)]
struct PlotterArgs {
    /// Directory to watch for new plots. May be repeated.
    #[clap(
        long = "path",
        short = 'p',
        env = "GARDEN_PLOTTER_PATHS",
        value_delimiter = ','
    )]
    paths: Vec<PathBuf>,

    /// Maximum number of concurrent outbound transfers.
    #[clap(
        long,
        short = 't',
        env = "GARDEN_PLOTTER_MAX_TRANSFERS",
        default_value_t = plotter::config::defaults::MAX_TRANSFERS
    )]
    max_transfers: usize,

    /// The suffix or extension of plot files, without the leading dot.
    #[clap(
        long,
        short = 's',
        env = "GARDEN_PLOTTER_SUFFIX",
        default_value = plotter::config::defaults::SUFFIX
    )]
    suffix: String,

    /// Socket address on which Prometheus metrics are exported.
    #[clap(
        long,
        env = "GARDEN_PLOTTER_METRICS_ADDRESS",
        default_value_t = plotter::config::defaults::metrics_address()
    )]
    metrics_address: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing_subscriber()?;

    match args.command {
        Commands::Harvester(harvester_args) => {
            commands::harvester(args.nats_url, harvester_args).await
        }
        Commands::Plotter(plotter_args) => commands::plotter(args.nats_url, plotter_args).await,
    }
}

mod commands {
    use super::*;

    pub(super) async fn harvester(nats_url: String, args: HarvesterArgs) -> anyhow::Result<()> {
        tracing::info!("starting harvester...");
        let http_ip = match args.http_ip {
            Some(ip) => ip,
            None => utils::default_host_ip()
                .context("failed to determine the host IP address; pass --http-ip")?,
        };

        harvester::run(HarvesterConfig {
            nats_url,
            paths: args.paths,
            expand_paths: args.expand_paths,
            max_transfers: args.max_transfers,
            http_ip,
            http_port: args.http_port,
            metrics_address: args.metrics_address,
        })
        .await
    }

    pub(super) async fn plotter(nats_url: String, args: PlotterArgs) -> anyhow::Result<()> {
        tracing::info!("starting plotter...");
        plotter::run(PlotterConfig {
            nats_url,
            watch_paths: args.paths,
            max_transfers: args.max_transfers,
            suffix: args.suffix,
            metrics_address: args.metrics_address,
        })
        .await
    }
}
