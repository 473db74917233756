// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for the garden services.

use std::{
    io,
    net::{IpAddr, UdpSocket},
    path::Path,
};

use anyhow::{Context as _, Result};
use tokio::signal::unix::{signal, SignalKind};

/// Waits until the process receives SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("unable to install the SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("unable to listen for SIGINT")?,
        _ = terminate.recv() => (),
    }
    Ok(())
}

/// Returns the IP address of the default network interface on the machine.
///
/// Opens a UDP socket towards a dummy address, which binds the local end of the socket to the
/// interface carrying the default route; no packet is ever sent.
pub fn default_host_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("1.2.3.4", 1)).ok()?;
    socket.local_addr().ok().map(|address| address.ip())
}

/// Free and total space of the filesystem backing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiskSpace {
    pub free: u64,
    pub total: u64,
}

/// Queries the space of the mounted filesystem containing `path`.
///
/// The match is by longest mount-point prefix, so a storage directory on a dedicated disk
/// reports that disk rather than the root filesystem.
pub(crate) fn disk_space(path: &Path) -> io::Result<DiskSpace> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| DiskSpace {
            free: disk.available_space(),
            total: disk.total_space(),
        })
        .ok_or_else(|| {
            io::Error::other(format!(
                "no mounted filesystem found for {}",
                path.display()
            ))
        })
}
