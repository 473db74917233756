// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! The plotter-side transfer state machine.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use garden_bus::PlotReadyRequest;
use reqwest::StatusCode;
use tokio::sync::{mpsc, Mutex};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

use super::Plotter;

/// Maximum placement-and-transfer attempts each time a plot is dequeued.
pub(crate) const MAX_TRANSFER_ATTEMPTS: usize = 10;

/// How long to wait after an attempt in which the cluster gave no usable answer.
pub(crate) const TRANSFER_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// What to do after a transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// The plot is stored; delete the local copy and stop.
    Stored,
    /// Wait out the backoff before asking the cluster again.
    Backoff,
    /// Re-broadcast immediately: a busy or undersized harvester merely answered first, and
    /// racing the taint again quickly lets a better candidate win.
    RetryNow,
    /// Give up on this plot for the rest of this run.
    Abandon,
}

impl RetryDecision {
    /// Maps the receiver's status code to the next action.
    pub(crate) fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Stored
        } else if status == StatusCode::INTERNAL_SERVER_ERROR {
            // The harvester failed mid-write and paused that path; give the cluster a minute.
            Self::Backoff
        } else {
            Self::RetryNow
        }
    }
}

/// Runs one transfer worker until the queue closes or shutdown is requested.
///
/// Workers share a single receiver; each transfer runs to completion before the worker looks at
/// the queue again, so cancellation only interrupts the idle wait.
pub(crate) async fn run_worker(
    plotter: Arc<Plotter>,
    queue: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
    requeue: mpsc::Sender<PathBuf>,
    cancel_token: CancellationToken,
) {
    loop {
        let plot = tokio::select! {
            _ = cancel_token.cancelled() => break,
            plot = recv_next(&queue) => match plot {
                Some(plot) => plot,
                None => break,
            },
        };
        handle_plot(&plotter, &requeue, plot).await;
    }
}

async fn recv_next(queue: &Mutex<mpsc::Receiver<PathBuf>>) -> Option<PathBuf> {
    queue.lock().await.recv().await
}

/// Drives one plot through the transfer state machine.
///
/// After the attempts are exhausted the plot is pushed back onto the shared queue, so that
/// other plots get their turn in between, and recorded in the failed-plots list.
pub(crate) async fn handle_plot(
    plotter: &Plotter,
    requeue: &mpsc::Sender<PathBuf>,
    plot: PathBuf,
) {
    let metadata = match tokio::fs::metadata(&plot).await {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(%error, plot = %plot.display(), "failed to stat plot file");
            return;
        }
    };
    let Some(name) = plot.file_name().and_then(|name| name.to_str()) else {
        tracing::warn!(plot = %plot.display(), "plot file has no usable name");
        return;
    };
    let request = PlotReadyRequest {
        name: name.to_owned(),
        size: metadata.len(),
    };

    for _ in 0..MAX_TRANSFER_ATTEMPTS {
        plotter.metrics.transfer_attempts.inc();
        match attempt_transfer(plotter, &plot, &request).await {
            RetryDecision::Stored => {
                if let Err(error) = tokio::fs::remove_file(&plot).await {
                    tracing::warn!(%error, plot = %plot.display(), "failed to remove transferred plot");
                }
                plotter.metrics.plots_transferred.inc();
                plotter.metrics.bytes_transferred.inc_by(request.size);
                return;
            }
            RetryDecision::Abandon => {
                plotter.metrics.transfer_failures.inc();
                return;
            }
            RetryDecision::Backoff => {
                plotter.metrics.transfer_failures.inc();
                tokio::time::sleep(TRANSFER_RETRY_BACKOFF).await;
            }
            RetryDecision::RetryNow => plotter.metrics.transfer_failures.inc(),
        }
    }

    tracing::warn!(
        plot = %plot.display(),
        "transfer attempts exhausted, will retry later or on next restart"
    );
    plotter.metrics.plots_requeued.inc();
    plotter.record_failed(plot.clone());
    if requeue.try_send(plot).is_err() {
        tracing::warn!("queue full, dropping requeue; the plot is rediscovered at the next startup");
    }
}

async fn attempt_transfer(
    plotter: &Plotter,
    plot: &Path,
    request: &PlotReadyRequest,
) -> RetryDecision {
    let reply = match plotter.bus.plot_ready(request).await {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            tracing::info!(name = %request.name, "no harvester accepted the plot");
            return RetryDecision::Backoff;
        }
        Err(error) => {
            tracing::warn!(%error, "error on plot ready request");
            return RetryDecision::Backoff;
        }
    };

    tracing::info!(
        plot = %plot.display(),
        host = %reply.hostname,
        store = %reply.store,
        "sending plot"
    );
    let start = Instant::now();
    let status = match post_plot(&plotter.http, &reply.url, plot, request.size).await {
        Ok(status) => status,
        Err(PostPlotError::Open(error)) => {
            tracing::warn!(%error, plot = %plot.display(), "failed to open plot file, bailing");
            return RetryDecision::Abandon;
        }
        Err(PostPlotError::Http(error)) => {
            tracing::warn!(%error, "plot transfer failed");
            return RetryDecision::Backoff;
        }
    };

    let decision = RetryDecision::from_status(status);
    match decision {
        RetryDecision::Stored => {
            let seconds = start.elapsed().as_secs_f64();
            tracing::info!(
                plot = %plot.display(),
                bytes = request.size,
                seconds,
                rate_mib_s = request.size as f64 / seconds.max(f64::EPSILON) / (1024.0 * 1024.0),
                "finished transferring plot"
            );
        }
        RetryDecision::Backoff => {
            tracing::warn!(%status, "harvester failed while storing, backing off");
        }
        RetryDecision::RetryNow => {
            tracing::debug!(%status, "harvester refused the plot, re-racing placement");
        }
        RetryDecision::Abandon => (),
    }
    decision
}

/// Failure modes of a single POST, distinguished because they map to different retry actions.
#[derive(Debug, thiserror::Error)]
pub enum PostPlotError {
    /// The local plot file could not be opened.
    #[error("failed to open the plot file: {0}")]
    Open(#[source] std::io::Error),
    /// The transfer itself failed at the transport level.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Streams a plot file to a harvester's transfer URL with an explicit content length.
pub async fn post_plot(
    http: &reqwest::Client,
    url: &str,
    plot: &Path,
    size: u64,
) -> Result<StatusCode, PostPlotError> {
    let file = tokio::fs::File::open(plot)
        .await
        .map_err(PostPlotError::Open)?;
    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
        .send()
        .await?;
    Ok(response.status())
}

#[cfg(test)]
mod tests {
    use garden_test_utils::param_test;

    use super::*;

    param_test! {
        status_decisions {
            created(StatusCode::CREATED, RetryDecision::Stored),
            internal_error(StatusCode::INTERNAL_SERVER_ERROR, RetryDecision::Backoff),
            unknown_store(StatusCode::NOT_FOUND, RetryDecision::RetryNow),
            already_exists(StatusCode::CONFLICT, RetryDecision::RetryNow),
            missing_length(StatusCode::LENGTH_REQUIRED, RetryDecision::RetryNow),
            insufficient_space(StatusCode::PAYLOAD_TOO_LARGE, RetryDecision::RetryNow),
            busy_or_capped(StatusCode::SERVICE_UNAVAILABLE, RetryDecision::RetryNow),
        }
    }
    fn status_decisions(status: StatusCode, expected: RetryDecision) {
        assert_eq!(RetryDecision::from_status(status), expected);
    }
}
