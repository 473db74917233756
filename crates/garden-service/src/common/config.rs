// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration shared between node roles.

/// Default bus endpoint, matching a local NATS server in its default configuration.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
