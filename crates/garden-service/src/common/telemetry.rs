// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tracing-subscriber initialization and the Prometheus metrics endpoint.

use std::{env, io, net::SocketAddr, str::FromStr};

use anyhow::{bail, Result};
use axum::{extract::Extension, http::StatusCode, routing::get, Router};
use prometheus::{Registry, TextEncoder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer};

const METRICS_ROUTE: &str = "/metrics";

/// Log output style, chosen through the `LOG_FORMAT` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LogFormat {
    /// The standard single-line fmt output.
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" | "default" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => bail!("unsupported LOG_FORMAT value {other:?}"),
        }
    }
}

impl LogFormat {
    fn from_env() -> Result<Self> {
        match env::var("LOG_FORMAT") {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` controls the filter (INFO level when unset); `LOG_FORMAT` selects the output
/// style. Everything goes to stderr so that stdout stays clean for tooling.
pub fn init_tracing_subscriber() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let output = match LogFormat::from_env()? {
        LogFormat::Full => base.boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .init();
    tracing::debug!("initialized global tracing subscriber");
    Ok(())
}

/// Starts an HTTP server whose sole purpose is to expose the given registry to a scraping
/// Prometheus agent.
pub fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
    cancel_token: CancellationToken,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        let app = Router::new()
            .route(METRICS_ROUTE, get(metrics))
            .layer(Extension(registry));

        let listener = tokio::net::TcpListener::bind(address).await?;
        tracing::info!(%address, "started Prometheus metrics endpoint");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel_token.cancelled_owned())
            .await
    })
}

async fn metrics(Extension(registry): Extension<Registry>) -> (StatusCode, String) {
    match TextEncoder.encode_to_string(&registry.gather()) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use garden_test_utils::param_test;

    use super::*;

    param_test! {
        log_format_parses {
            full("full", LogFormat::Full),
            default_alias("default", LogFormat::Full),
            compact("compact", LogFormat::Compact),
            mixed_case("Pretty", LogFormat::Pretty),
            json("json", LogFormat::Json),
        }
    }
    fn log_format_parses(value: &str, expected: LogFormat) {
        assert_eq!(value.parse::<LogFormat>().unwrap(), expected);
    }

    #[test]
    fn log_format_rejects_unknown_values() {
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
