// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Plotter-side bus client.

use std::time::Duration;

use async_nats::RequestErrorKind;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    BusError,
    PlotLocateReply,
    PlotLocateRequest,
    PlotReadyReply,
    PlotReadyRequest,
    ReplyEnvelope,
    PLOT_LOCATE_SUBJECT,
    PLOT_LOCATE_TIMEOUT,
    PLOT_READY_SUBJECT,
    PLOT_READY_TIMEOUT,
};

/// Request/reply client used by plotters.
///
/// Both calls broadcast to all harvesters and resolve with the first reply; `Ok(None)` means no
/// harvester answered within the request window.
#[derive(Debug, Clone)]
pub struct BusClient {
    client: async_nats::Client,
}

impl BusClient {
    /// Wraps an established bus connection.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Announces a plot and returns the winning harvester's offer, if any.
    pub async fn plot_ready(
        &self,
        request: &PlotReadyRequest,
    ) -> Result<Option<PlotReadyReply>, BusError> {
        self.request(PLOT_READY_SUBJECT, request, PLOT_READY_TIMEOUT)
            .await
    }

    /// Asks whether any harvester already stores the given plot.
    ///
    /// A timeout is the expected outcome for a plot that exists nowhere, and maps to `Ok(None)`.
    pub async fn plot_locate(
        &self,
        request: &PlotLocateRequest,
    ) -> Result<Option<PlotLocateReply>, BusError> {
        self.request(PLOT_LOCATE_SUBJECT, request, PLOT_LOCATE_TIMEOUT)
            .await
    }

    async fn request<Req, Reply>(
        &self,
        subject: &'static str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Option<Reply>, BusError>
    where
        Req: Serialize,
        Reply: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let request = async_nats::Request::new()
            .payload(payload.into())
            .timeout(Some(timeout));

        let message = match self.client.send_request(subject, request).await {
            Ok(message) => message,
            Err(error)
                if matches!(
                    error.kind(),
                    RequestErrorKind::TimedOut | RequestErrorKind::NoResponders
                ) =>
            {
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let envelope: ReplyEnvelope = serde_json::from_slice(&message.payload)?;
        if let Some(error) = envelope.error {
            return Err(BusError::Remote(error));
        }
        envelope
            .result
            .map(serde_json::from_value)
            .transpose()
            .map_err(BusError::from)
    }
}
