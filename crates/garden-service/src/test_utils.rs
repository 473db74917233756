// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities for exercising the garden services in-process.

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::harvester::{
    plot_paths::{PlotPath, PlotPaths},
    server::TransferServer,
    Harvester,
};

/// Builds a harvester over `(directory, free_space, total_space)` triples, without probing any
/// filesystem.
pub fn harvester_with_paths(
    paths: Vec<(PathBuf, u64, u64)>,
    max_transfers: usize,
) -> Arc<Harvester> {
    Harvester::for_testing(
        PlotPaths::from_parts(
            paths
                .into_iter()
                .map(|(path, free, total)| PlotPath::with_space(path, free, total))
                .collect(),
        ),
        max_transfers,
    )
}

/// Spawns a transfer server for `harvester` on an ephemeral local port.
///
/// Returns the bound address and the token cancelling the server.
pub async fn spawn_transfer_server(
    harvester: Arc<Harvester>,
) -> io::Result<(SocketAddr, CancellationToken)> {
    let cancel_token = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let server = TransferServer::new(harvester, cancel_token.child_token());
    tokio::spawn(server.serve_on(listener));
    Ok((address, cancel_token))
}
