// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the transfer path: a plotter-side streamed POST against a live
//! transfer receiver writing into real directories.

use garden_service::{plotter::transfer::post_plot, test_utils};
use garden_test_utils::random_data;
use reqwest::StatusCode;
use tempfile::TempDir;

const PLENTY: u64 = 10 * 1024 * 1024 * 1024;

#[tokio::test]
async fn streams_a_plot_end_to_end() -> garden_test_utils::Result {
    let source = TempDir::new()?;
    let plot = source.path().join("e2e.plot");
    let data = random_data(256 * 1024);
    std::fs::write(&plot, &data)?;

    let target = TempDir::new()?;
    let store = target.path().canonicalize()?;
    let harvester = test_utils::harvester_with_paths(vec![(store.clone(), PLENTY, PLENTY)], 5);
    let (address, _cancel) = test_utils::spawn_transfer_server(harvester).await?;

    let url = format!("http://{address}{}/e2e.plot", store.display());
    let http = reqwest::Client::new();

    let status = post_plot(&http, &url, &plot, data.len() as u64).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(std::fs::read(store.join("e2e.plot"))?, data);
    assert!(!store.join("e2e.plot.tmp").exists());

    // Offering the same plot again is refused without touching the stored copy.
    let status = post_plot(&http, &url, &plot, data.len() as u64).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(std::fs::read(store.join("e2e.plot"))?, data);
    Ok(())
}

#[tokio::test]
async fn an_undersized_store_refuses_and_leaves_nothing_behind() -> garden_test_utils::Result {
    let source = TempDir::new()?;
    let plot = source.path().join("big.plot");
    let data = random_data(128 * 1024);
    std::fs::write(&plot, &data)?;

    let target = TempDir::new()?;
    let store = target.path().canonicalize()?;
    let harvester = test_utils::harvester_with_paths(vec![(store.clone(), 1024, PLENTY)], 5);
    let (address, _cancel) = test_utils::spawn_transfer_server(harvester).await?;

    let url = format!("http://{address}{}/big.plot", store.display());
    let status = post_plot(&reqwest::Client::new(), &url, &plot, data.len() as u64).await?;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!store.join("big.plot").exists());
    assert!(!store.join("big.plot.tmp").exists());
    // The refused plot is still on the plotter, ready for the next placement race.
    assert!(plot.exists());
    Ok(())
}
