// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Plotter configuration.

use std::{net::SocketAddr, path::PathBuf};

/// Configuration of a plotter node.
#[derive(Debug, Clone)]
pub struct PlotterConfig {
    /// URL of the bus endpoint.
    pub nats_url: String,
    /// Directories watched for newly created plots.
    pub watch_paths: Vec<PathBuf>,
    /// Number of concurrent outbound transfers (the size of the worker pool).
    pub max_transfers: usize,
    /// File extension identifying plot files, without the leading dot.
    pub suffix: String,
    /// Socket address on which the Prometheus metrics endpoint listens.
    pub metrics_address: SocketAddr,
}

pub mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    /// Default number of concurrent outbound transfers.
    pub const MAX_TRANSFERS: usize = 2;
    /// Default plot-file extension.
    pub const SUFFIX: &str = "plot";
    /// Default metrics port.
    pub const METRICS_PORT: u16 = 9185;

    /// Returns the default metrics address.
    pub fn metrics_address() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, METRICS_PORT).into()
    }
}
