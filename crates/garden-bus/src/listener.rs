// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Harvester-side bus listener.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt as _;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    BusError,
    PlotLocateReply,
    PlotLocateRequest,
    PlotReadyReply,
    PlotReadyRequest,
    ReplyEnvelope,
    PLOT_LOCATE_SUBJECT,
    PLOT_READY_SUBJECT,
};

/// Operations a harvester exposes on the bus.
///
/// Returning `Ok(None)` suppresses the reply entirely, which is how a harvester declines a
/// request it cannot serve; the plotter only ever hears from willing candidates. Errors are sent
/// back in the reply envelope.
#[async_trait]
pub trait PlotService {
    /// Evaluates a placement request, optionally delaying the reply to encode load.
    async fn plot_ready(
        &self,
        request: PlotReadyRequest,
    ) -> Result<Option<PlotReadyReply>, anyhow::Error>;

    /// Reports whether this harvester stores a plot of the given name and size.
    async fn plot_locate(
        &self,
        request: PlotLocateRequest,
    ) -> Result<Option<PlotLocateReply>, anyhow::Error>;
}

/// Subscribes to both plot subjects and dispatches inbound requests to `service`.
///
/// Each message is handled on its own task so that one harvester's taint delay never blocks the
/// processing of other requests. Returns once `cancel_token` is cancelled.
pub async fn serve<S>(
    client: async_nats::Client,
    service: Arc<S>,
    cancel_token: CancellationToken,
) -> Result<(), BusError>
where
    S: PlotService + Send + Sync + 'static,
{
    let mut ready = client.subscribe(PLOT_READY_SUBJECT).await?;
    let mut locate = client.subscribe(PLOT_LOCATE_SUBJECT).await?;
    client.flush().await?;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            message = ready.next() => {
                let Some(message) = message else { break };
                let client = client.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    dispatch(&client, message, |request| async move {
                        service.plot_ready(request).await
                    })
                    .await;
                });
            }
            message = locate.next() => {
                let Some(message) = message else { break };
                let client = client.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    dispatch(&client, message, |request| async move {
                        service.plot_locate(request).await
                    })
                    .await;
                });
            }
        }
    }

    ready.unsubscribe().await.ok();
    locate.unsubscribe().await.ok();
    Ok(())
}

/// Decodes a request, runs the handler, and publishes the enveloped outcome.
///
/// No reply is published when the handler declines (`Ok(None)`) or when the request carries no
/// reply inbox.
async fn dispatch<Req, Reply, F, Fut>(
    client: &async_nats::Client,
    message: async_nats::Message,
    handler: F,
) where
    Req: DeserializeOwned,
    Reply: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Option<Reply>, anyhow::Error>>,
{
    let request: Req = match serde_json::from_slice(&message.payload) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%error, subject = %message.subject, "dropping undecodable bus request");
            return;
        }
    };

    let envelope = match handler(request).await {
        Ok(Some(reply)) => match ReplyEnvelope::result(&reply) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(%error, "failed to encode bus reply");
                ReplyEnvelope::error(error.to_string())
            }
        },
        Ok(None) => return,
        Err(error) => ReplyEnvelope::error(error.to_string()),
    };

    let Some(reply_subject) = message.reply else {
        if let Some(error) = &envelope.error {
            tracing::warn!(%error, "handler failed for a request without a reply inbox");
        }
        return;
    };

    let payload = match serde_json::to_vec(&envelope) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::error!(%error, "failed to serialize reply envelope");
            return;
        }
    };
    if let Err(error) = client.publish(reply_subject, payload.into()).await {
        tracing::warn!(%error, "failed to publish bus reply");
    }
}
