// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Functionality shared between the harvester and plotter services.

pub mod config;
pub mod telemetry;
pub mod utils;
