// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Request/reply bus adapter for the garden plot-transport cluster.
//!
//! Plotters broadcast placement requests on a NATS subject that every harvester subscribes to.
//! Each harvester independently decides whether to answer, and delays its reply according to its
//! own load; the plotter takes the first reply it hears. A second subject is used at plotter
//! startup to check whether a leftover local plot already exists somewhere in the cluster.
//!
//! Harvesters that have nothing useful to say do not reply at all, so a request timeout on the
//! plotter side is a meaningful signal rather than an error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod client;
pub use client::BusClient;

mod listener;
pub use listener::{serve, PlotService};

/// Subject on which plotters announce a freshly produced plot awaiting placement.
pub const PLOT_READY_SUBJECT: &str = "garden.plot.ready";

/// Subject on which plotters ask whether any harvester already stores a plot.
pub const PLOT_LOCATE_SUBJECT: &str = "garden.plot.locate";

/// How long a plotter waits for the first placement reply.
///
/// This bounds the taint delay any harvester may self-impose: a reply delayed past this window is
/// never heard.
pub const PLOT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a plotter waits for a locate reply before concluding the plot is absent.
pub const PLOT_LOCATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Announcement of a new plot awaiting placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotReadyRequest {
    /// Base name of the plot file, without any directory components.
    pub name: String,
    /// Size of the plot file in bytes.
    pub size: u64,
}

/// A harvester's offer to store an announced plot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotReadyReply {
    /// Hostname of the offering harvester.
    pub hostname: String,
    /// The storage directory the harvester selected for this plot.
    pub store: String,
    /// Fully-qualified URL the plotter should POST the plot bytes to.
    pub url: String,
}

/// Query for an already-stored plot, identified by name and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotLocateRequest {
    /// Base name of the plot file.
    pub name: String,
    /// Size of the plot file in bytes.
    pub size: u64,
}

/// A harvester's confirmation that it stores the queried plot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotLocateReply {
    /// Hostname of the harvester holding the plot.
    pub hostname: String,
}

/// Wire envelope for every reply on the bus: either a result payload or an error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// The reply payload, if the handler produced one.
    pub result: Option<serde_json::Value>,
    /// An error message, if the handler failed.
    pub error: Option<String>,
}

impl ReplyEnvelope {
    fn result<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            result: Some(serde_json::to_value(value)?),
            error: None,
        })
    }

    fn error(message: String) -> Self {
        Self {
            result: None,
            error: Some(message),
        }
    }
}

/// Errors surfaced by the bus adapter.
///
/// Request timeouts and missing responders are deliberately *not* errors: both client calls
/// return `Ok(None)` in those cases, since "nobody answered" is a protocol-level signal.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Encoding a request or decoding a reply failed.
    #[error("failed to encode or decode a bus payload: {0}")]
    Codec(#[from] serde_json::Error),
    /// The underlying request failed for a reason other than a timeout.
    #[error("bus request failed: {0}")]
    Request(#[from] async_nats::RequestError),
    /// Subscribing to a subject failed.
    #[error("bus subscription failed: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
    /// Publishing a reply failed.
    #[error("publishing a bus reply failed: {0}")]
    Publish(#[from] async_nats::PublishError),
    /// Flushing the connection failed.
    #[error("flushing the bus connection failed: {0}")]
    Flush(#[from] async_nats::client::FlushError),
    /// The remote handler answered with an error envelope.
    #[error("remote replied with an error: {0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use garden_test_utils::param_test;
    use serde_json::json;

    use super::*;

    #[test]
    fn ready_request_wire_shape() {
        let request = PlotReadyRequest {
            name: "a.plot".to_owned(),
            size: 108_000_000_000,
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded, json!({"name": "a.plot", "size": 108_000_000_000u64}));
    }

    #[test]
    fn ready_reply_wire_shape() {
        let reply = PlotReadyReply {
            hostname: "h1".to_owned(),
            store: "/mnt/disk0".to_owned(),
            url: "http://10.0.0.5:3434/mnt/disk0/a.plot".to_owned(),
        };
        let encoded = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            encoded,
            json!({
                "hostname": "h1",
                "store": "/mnt/disk0",
                "url": "http://10.0.0.5:3434/mnt/disk0/a.plot",
            })
        );
    }

    param_test! {
        envelope_round_trips {
            with_result(r#"{"result":{"hostname":"h2"},"error":null}"#, true, false),
            with_error(r#"{"result":null,"error":"no paths available"}"#, false, true),
        }
    }
    fn envelope_round_trips(encoded: &str, has_result: bool, has_error: bool) {
        let envelope: ReplyEnvelope = serde_json::from_str(encoded).unwrap();
        assert_eq!(envelope.result.is_some(), has_result);
        assert_eq!(envelope.error.is_some(), has_error);
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            encoded,
            "re-encoding must preserve the wire shape"
        );
    }

    #[test]
    fn error_envelope_construction() {
        let envelope = ReplyEnvelope::error("boom".to_owned());
        assert!(envelope.result.is_none());
        assert_eq!(envelope.error.as_deref(), Some("boom"));
    }
}
