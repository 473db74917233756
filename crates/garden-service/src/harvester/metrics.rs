// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Metrics exported by a harvester.
#[derive(Debug, Clone)]
pub(crate) struct HarvesterMetricSet {
    /// Number of transfers currently writing to local storage.
    pub transfers_in_flight: IntGauge,
    /// Total count of plots stored successfully.
    pub plots_stored: IntCounter,
    /// Total bytes of plot data stored successfully.
    pub bytes_stored: IntCounter,
    /// Total count of refused or failed plot uploads, by status code.
    pub store_rejections: IntCounterVec,
    /// Time spent serving HTTP requests, by method, route, and status code.
    pub request_durations: HistogramVec,
}

impl HarvesterMetricSet {
    pub fn new(registry: &Registry) -> Self {
        Self {
            transfers_in_flight: register_int_gauge_with_registry!(
                "harvester_transfers_in_flight",
                "Number of transfers currently writing to local storage",
                registry
            )
            .expect("metric registration must not fail"),
            plots_stored: register_int_counter_with_registry!(
                "harvester_plots_stored_total",
                "Total count of plots stored successfully",
                registry
            )
            .expect("metric registration must not fail"),
            bytes_stored: register_int_counter_with_registry!(
                "harvester_bytes_stored_total",
                "Total bytes of plot data stored successfully",
                registry
            )
            .expect("metric registration must not fail"),
            store_rejections: register_int_counter_vec_with_registry!(
                "harvester_store_rejections_total",
                "Total count of refused or failed plot uploads, by status code",
                &["status_code"],
                registry
            )
            .expect("metric registration must not fail"),
            request_durations: register_histogram_vec_with_registry!(
                prometheus::HistogramOpts::new(
                    "request_duration_seconds",
                    "Time (in seconds) spent serving HTTP requests",
                )
                .namespace("http"),
                &["method", "route", "status_code"],
                registry
            )
            .expect("metric registration must not fail"),
        }
    }
}
