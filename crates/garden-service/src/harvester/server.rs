// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! The HTTP endpoint through which plotters deliver plot files.

use std::{
    io,
    path::{Path as StdPath, PathBuf},
    sync::Arc,
    time::Instant,
};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt as _;
use prometheus::HistogramVec;
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tower_http::trace::TraceLayer;

use super::{
    plot_paths::{PlotPath, WRITE_FAILURE_COOLDOWN},
    Harvester,
};

const HEALTH_ENDPOINT: &str = "/healthz";
const TRANSFER_ENDPOINT: &str = "/{*path}";

/// Serves plot uploads for a [`Harvester`].
#[derive(Debug)]
pub struct TransferServer {
    harvester: Arc<Harvester>,
    cancel_token: CancellationToken,
}

impl TransferServer {
    pub fn new(harvester: Arc<Harvester>, cancel_token: CancellationToken) -> Self {
        Self {
            harvester,
            cancel_token,
        }
    }

    /// Serves requests on an already-bound listener until cancelled, then drains in-flight
    /// uploads.
    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> io::Result<()> {
        let app = Router::new()
            .route(HEALTH_ENDPOINT, get(health_info))
            .route(
                TRANSFER_ENDPOINT,
                post(store_plot).route_layer(DefaultBodyLimit::disable()),
            )
            .with_state(self.harvester.clone())
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn_with_state(
                self.harvester.metrics.request_durations.clone(),
                metrics_middleware,
            ));

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel_token.cancelled_owned())
            .await
    }
}

async fn metrics_middleware(
    State(metrics): State<HistogramVec>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let route: String = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().into())
        // Do not label by the raw URI; unmatched requests would mint a histogram each.
        .unwrap_or_else(|| "unmatched".into());

    let response = next.run(request).await;

    metrics
        .with_label_values(&[method.as_str(), &route, response.status().as_str()])
        .observe(start.elapsed().as_secs_f64());
    response
}

/// Rejections and failures of the transfer endpoint, in admission-pipeline order.
#[derive(Debug, thiserror::Error)]
pub enum StorePlotError {
    /// The parent directory of the request path is not a registered storage path.
    #[error("no registered storage path contains {}", .0.display())]
    UnknownStore(PathBuf),
    /// The harvester is already running its maximum number of concurrent transfers.
    #[error("harvester is at its concurrent transfer limit")]
    AtCapacity,
    /// Another transfer is writing to the targeted storage path.
    #[error("storage path {} is already receiving a plot", .0.display())]
    StoreBusy(PathBuf),
    /// The request did not declare a non-zero content length.
    #[error("a non-zero content length is required")]
    LengthRequired,
    /// The targeted storage path cannot hold the declared number of bytes.
    #[error("plot needs {needed} bytes but only {free} are free")]
    InsufficientSpace { needed: u64, free: u64 },
    /// A plot of the same name is already fully stored at the target.
    #[error("a plot already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    /// Writing the plot failed; no partial file remains.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorePlotError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownStore(_) => StatusCode::NOT_FOUND,
            Self::AtCapacity | Self::StoreBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::InsufficientSpace { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StorePlotError {
    fn into_response(self) -> Response {
        if let Self::Io(error) = &self {
            tracing::error!(%error, "failure while writing plot");
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// Accepts one plot file into a registered storage path.
///
/// The admission pipeline fails fast, in order: unknown store, transfer ceiling, busy path,
/// missing length, insufficient space, existing file. Everything past admission holds the
/// path's transfer guard, so at most one request writes to a given disk at any instant. The
/// body lands in `<final>.tmp` and is renamed onto the final name only after every declared
/// byte has been written: a non-2xx response implies no file of the final name exists.
#[tracing::instrument(skip_all, fields(path = tracing::field::Empty))]
async fn store_plot(
    State(harvester): State<Arc<Harvester>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, StorePlotError> {
    let target = PathBuf::from(format!("/{path}"));
    tracing::Span::current().record("path", tracing::field::display(target.display()));

    let result = try_store_plot(&harvester, target, headers, body).await;
    if let Err(error) = &result {
        harvester
            .metrics
            .store_rejections
            .with_label_values(&[error.status().as_str()])
            .inc();
    }
    result
}

async fn try_store_plot(
    harvester: &Arc<Harvester>,
    target: PathBuf,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, StorePlotError> {
    let plot_path = lookup_store(harvester, &target)?;

    if harvester.in_flight() >= harvester.max_transfers {
        tracing::warn!("request rejected, at max transfers");
        return Err(StorePlotError::AtCapacity);
    }

    if plot_path.is_busy() {
        tracing::warn!("request rejected, store already transferring");
        return Err(StorePlotError::StoreBusy(plot_path.path().to_path_buf()));
    }

    let declared_length = content_length(&headers).ok_or(StorePlotError::LengthRequired)?;

    // Everything below holds the transfer guard; busy, the in-flight count, and the path lock
    // are released together on every exit path.
    let guard = TransferGuard::acquire(harvester, plot_path.clone())
        .ok_or_else(|| StorePlotError::StoreBusy(plot_path.path().to_path_buf()))?;

    if plot_path.free_space() <= declared_length {
        tracing::warn!(
            needed = declared_length,
            free = plot_path.free_space(),
            "request rejected, not enough space"
        );
        return Err(StorePlotError::InsufficientSpace {
            needed: declared_length,
            free: plot_path.free_space(),
        });
    }

    if tokio::fs::metadata(&target).await.is_ok() {
        tracing::warn!("request rejected, file already exists");
        return Err(StorePlotError::AlreadyExists(target));
    }

    let start = Instant::now();
    let result = write_plot(&target, body, declared_length).await;
    harvester.paths.refresh(&plot_path);
    drop(guard);

    let written = result.inspect_err(|_| plot_path.pause(WRITE_FAILURE_COOLDOWN))?;

    let seconds = start.elapsed().as_secs_f64();
    harvester.metrics.plots_stored.inc();
    harvester.metrics.bytes_stored.inc_by(written);
    tracing::info!(
        bytes = written,
        seconds,
        rate_mib_s = written as f64 / seconds.max(f64::EPSILON) / (1024.0 * 1024.0),
        "successfully stored plot"
    );
    Ok(StatusCode::CREATED)
}

/// Resolves the request path to a registered storage path.
fn lookup_store(
    harvester: &Harvester,
    target: &StdPath,
) -> Result<Arc<PlotPath>, StorePlotError> {
    let unknown = || StorePlotError::UnknownStore(target.to_path_buf());
    if target.file_name().is_none() {
        return Err(unknown());
    }
    let store = target.parent().ok_or_else(unknown)?;
    harvester.paths.get(store).cloned().ok_or_else(unknown)
}

/// Extracts a non-zero declared content length.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
        .filter(|length| *length > 0)
}

/// Streams the body into `<target>.tmp` and promotes it on success.
///
/// On any failure the temporary file is removed before the error is returned, so a partial
/// write never leaves a file behind under either name.
async fn write_plot(target: &StdPath, body: Body, declared_length: u64) -> io::Result<u64> {
    let temp_path = temp_plot_path(target);
    match store_body(&temp_path, target, body, declared_length).await {
        Ok(written) => Ok(written),
        Err(error) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(error)
        }
    }
}

async fn store_body(
    temp_path: &StdPath,
    target: &StdPath,
    body: Body,
    declared_length: u64,
) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    let written = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    if written != declared_length {
        return Err(io::Error::other(format!(
            "body ended after {written} of {declared_length} declared bytes"
        )));
    }

    tokio::fs::rename(temp_path, target).await?;
    Ok(written)
}

fn temp_plot_path(target: &StdPath) -> PathBuf {
    let mut path = target.as_os_str().to_owned();
    path.push(".tmp");
    PathBuf::from(path)
}

/// RAII ownership of one admitted transfer.
///
/// Construction takes the path's write lock, sets `busy`, and bumps the harvester-wide
/// in-flight count; dropping reverses all three, including on panic unwind.
struct TransferGuard {
    harvester: Arc<Harvester>,
    path: Arc<PlotPath>,
    _lock: tokio::sync::OwnedMutexGuard<()>,
}

impl TransferGuard {
    fn acquire(harvester: &Arc<Harvester>, path: Arc<PlotPath>) -> Option<Self> {
        let lock = path.try_lock_transfer()?;
        path.mark_busy();
        harvester
            .transfers
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        harvester.metrics.transfers_in_flight.inc();
        Some(Self {
            harvester: harvester.clone(),
            path,
            _lock: lock,
        })
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.path.clear_busy();
        self.harvester
            .transfers
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        self.harvester.metrics.transfers_in_flight.dec();
    }
}

#[derive(Debug, Serialize)]
struct HealthInfo {
    hostname: String,
    uptime_secs: u64,
    transfers_in_flight: usize,
}

async fn health_info(State(harvester): State<Arc<Harvester>>) -> Json<HealthInfo> {
    Json(HealthInfo {
        hostname: harvester.hostname.clone(),
        uptime_secs: harvester.started_at.elapsed().as_secs(),
        transfers_in_flight: harvester.in_flight(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use garden_test_utils::{async_param_test, random_data};
    use tempfile::TempDir;

    use super::*;
    use crate::test_utils;

    const PLENTY: u64 = 10 * 1024 * 1024 * 1024;

    struct TestStore {
        // Kept alive for the duration of the test.
        _dir: TempDir,
        store: PathBuf,
        address: SocketAddr,
        harvester: Arc<Harvester>,
    }

    impl TestStore {
        async fn start(free_space: u64, max_transfers: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let store = dir.path().canonicalize().unwrap();
            let harvester = test_utils::harvester_with_paths(
                vec![(store.clone(), free_space, PLENTY)],
                max_transfers,
            );
            let (address, _cancel) = test_utils::spawn_transfer_server(harvester.clone())
                .await
                .unwrap();
            Self {
                _dir: dir,
                store,
                address,
                harvester,
            }
        }

        fn url(&self, name: &str) -> String {
            format!("http://{}{}/{name}", self.address, self.store.display())
        }
    }

    #[tokio::test]
    async fn stores_a_plot_and_promotes_it_atomically() {
        let store = TestStore::start(PLENTY, 5).await;
        let data = random_data(64 * 1024);

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(data.clone())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(std::fs::read(store.store.join("a.plot")).unwrap(), data);
        assert!(!store.store.join("a.plot.tmp").exists());
        assert_eq!(store.harvester.metrics.plots_stored.get(), 1);
        assert_eq!(store.harvester.metrics.bytes_stored.get(), data.len() as u64);
    }

    #[tokio::test]
    async fn rejects_an_unregistered_store() {
        let store = TestStore::start(PLENTY, 5).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/not/registered/a.plot", store.address))
            .body(random_data(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            store
                .harvester
                .metrics
                .store_rejections
                .with_label_values(&["404"])
                .get(),
            1
        );
    }

    async_param_test! {
        refusal_leaves_no_file {
            at_max_transfers(PLENTY, 0, StatusCode::SERVICE_UNAVAILABLE),
            insufficient_space(1024, 5, StatusCode::PAYLOAD_TOO_LARGE),
        }
    }
    async fn refusal_leaves_no_file(free_space: u64, max_transfers: usize, expected: StatusCode) {
        let store = TestStore::start(free_space, max_transfers).await;

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(random_data(64 * 1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), expected);
        assert!(!store.store.join("a.plot").exists());
        assert!(!store.store.join("a.plot.tmp").exists());
        assert_eq!(
            store
                .harvester
                .metrics
                .store_rejections
                .with_label_values(&[expected.as_str()])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn rejects_a_busy_store() {
        let store = TestStore::start(PLENTY, 5).await;
        store.harvester.paths.get(&store.store).unwrap().mark_busy();

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(random_data(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn rejects_a_store_with_a_transfer_lock_held() {
        let store = TestStore::start(PLENTY, 5).await;
        let _lock = store
            .harvester
            .paths
            .get(&store.store)
            .unwrap()
            .try_lock_transfer()
            .unwrap();

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(random_data(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!store.store.join("a.plot").exists());
    }

    #[tokio::test]
    async fn requires_a_content_length() {
        let store = TestStore::start(PLENTY, 5).await;

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
        assert!(!store.store.join("a.plot").exists());
    }

    #[tokio::test]
    async fn rejects_an_existing_plot() {
        let store = TestStore::start(PLENTY, 5).await;
        std::fs::write(store.store.join("a.plot"), b"already here").unwrap();

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(random_data(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            std::fs::read(store.store.join("a.plot")).unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn busy_flag_clears_after_a_transfer() {
        let store = TestStore::start(PLENTY, 5).await;

        let response = reqwest::Client::new()
            .post(store.url("a.plot"))
            .body(random_data(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let path = store.harvester.paths.get(&store.store).unwrap();
        assert!(!path.is_busy());
        assert_eq!(store.harvester.in_flight(), 0);
    }

    #[tokio::test]
    async fn reports_health() {
        let store = TestStore::start(PLENTY, 5).await;

        let response = reqwest::Client::new()
            .get(format!("http://{}/healthz", store.address))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.text().await.unwrap();
        assert!(body.contains("test-harvester"));
    }
}
