// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

/// Metrics exported by a plotter.
#[derive(Debug, Clone)]
pub(crate) struct PlotterMetricSet {
    /// Total count of placement-and-transfer attempts.
    pub transfer_attempts: IntCounter,
    /// Total count of attempts that did not store the plot.
    pub transfer_failures: IntCounter,
    /// Total count of plots transferred successfully.
    pub plots_transferred: IntCounter,
    /// Total bytes of plot data transferred successfully.
    pub bytes_transferred: IntCounter,
    /// Total count of plots requeued after exhausting their attempts.
    pub plots_requeued: IntCounter,
    /// Number of plots currently on the failed-plots list.
    pub failed_plots: IntGauge,
}

impl PlotterMetricSet {
    pub fn new(registry: &Registry) -> Self {
        Self {
            transfer_attempts: register_int_counter_with_registry!(
                "plotter_transfer_attempts_total",
                "Total count of placement-and-transfer attempts",
                registry
            )
            .expect("metric registration must not fail"),
            transfer_failures: register_int_counter_with_registry!(
                "plotter_transfer_failures_total",
                "Total count of attempts that did not store the plot",
                registry
            )
            .expect("metric registration must not fail"),
            plots_transferred: register_int_counter_with_registry!(
                "plotter_plots_transferred_total",
                "Total count of plots transferred successfully",
                registry
            )
            .expect("metric registration must not fail"),
            bytes_transferred: register_int_counter_with_registry!(
                "plotter_bytes_transferred_total",
                "Total bytes of plot data transferred successfully",
                registry
            )
            .expect("metric registration must not fail"),
            plots_requeued: register_int_counter_with_registry!(
                "plotter_plots_requeued_total",
                "Total count of plots requeued after exhausting their attempts",
                registry
            )
            .expect("metric registration must not fail"),
            failed_plots: register_int_gauge_with_registry!(
                "plotter_failed_plots",
                "Number of plots currently on the failed-plots list",
                registry
            )
            .expect("metric registration must not fail"),
        }
    }
}
