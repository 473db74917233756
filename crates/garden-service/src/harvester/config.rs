// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Harvester configuration.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

/// Configuration of a harvester node.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    /// URL of the bus endpoint.
    pub nats_url: String,
    /// Directories in which to store plots.
    pub paths: Vec<PathBuf>,
    /// Parents whose immediate subdirectories all store plots.
    pub expand_paths: Vec<PathBuf>,
    /// Ceiling on concurrent inbound transfers.
    pub max_transfers: usize,
    /// The IP address advertised to plotters in placement replies.
    pub http_ip: IpAddr,
    /// The port on which plot transfers are accepted.
    pub http_port: u16,
    /// Socket address on which the Prometheus metrics endpoint listens.
    pub metrics_address: SocketAddr,
}

pub mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    /// Default ceiling on concurrent inbound transfers.
    pub const MAX_TRANSFERS: usize = 5;
    /// Default transfer port.
    pub const HTTP_PORT: u16 = 3434;
    /// Default metrics port.
    pub const METRICS_PORT: u16 = 9184;

    /// Returns the default metrics address.
    pub fn metrics_address() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, METRICS_PORT).into()
    }
}
