// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Service functionality for the garden plot-transport cluster.
//!
//! Two node roles share this crate: *plotters* produce large plot files and need to offload
//! them, and *harvesters* store those files across one or more local disks. Placement is
//! negotiated over a broadcast bus without any coordinator; see [`garden_bus`] for the protocol
//! and [`harvester`] for the taint mechanism that makes the best-placed host answer first.

pub mod common;
pub mod harvester;
pub mod plotter;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
