//! Slack Socket Mode listener.
//!
//! Opens a websocket through `apps.connections.open`, acknowledges every
//! envelope, and forwards `message` events to the relay. No public HTTP
//! endpoint is needed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use secrecy::Secret;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::web::SlackWeb;
use super::{SlackAdapter, SlackMessageEvent};
use crate::relay::RelayHandle;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

/// What the session loop should do after an envelope.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Continue,
    Reconnect,
}

/// Keep a socket mode session open until `shutdown` fires, reconnecting on failure.
pub async fn run(
    adapter: Arc<SlackAdapter>,
    web: Arc<SlackWeb>,
    app_token: Secret<String>,
    relay: RelayHandle,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    info!("Starting Slack socket mode listener...");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = run_session(&adapter, &web, &app_token, &relay) => match result {
                Ok(()) => info!("Slack socket session ended, reconnecting"),
                Err(e) => error!("Slack socket mode error: {:#}", e),
            },
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    info!("Slack socket mode listener stopped");
}

async fn run_session(
    adapter: &SlackAdapter,
    web: &SlackWeb,
    app_token: &Secret<String>,
    relay: &RelayHandle,
) -> Result<()> {
    let url = web.open_connection(app_token).await?;
    let (ws, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to Slack socket mode")?;
    let (mut sink, mut stream) = ws.split();

    while let Some(frame) = stream.next().await {
        let text = match frame.context("Slack socket read failed")? {
            Message::Text(text) => text,
            Message::Close(reason) => {
                info!("Slack socket closed: {:?}", reason);
                return Ok(());
            }
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Skipping malformed socket mode frame: {}", e);
                continue;
            }
        };

        // Slack redelivers anything not acknowledged within a few seconds
        if let Some(id) = &envelope.envelope_id {
            let ack = json!({ "envelope_id": id }).to_string();
            sink.send(Message::Text(ack.into()))
                .await
                .context("Failed to acknowledge Slack envelope")?;
        }

        if handle_envelope(adapter, relay, envelope).await? == Next::Reconnect {
            return Ok(());
        }
    }

    Ok(())
}

async fn handle_envelope(
    adapter: &SlackAdapter,
    relay: &RelayHandle,
    envelope: Envelope,
) -> Result<Next> {
    match envelope.kind.as_str() {
        "hello" => info!("Slack socket mode connected"),
        "disconnect" => {
            info!(
                "Slack requested disconnect: {}",
                envelope.reason.as_deref().unwrap_or("unspecified")
            );
            return Ok(Next::Reconnect);
        }
        "events_api" => {
            let mut payload = envelope.payload;
            let event = payload["event"].take();
            if event["type"] != "message" {
                return Ok(Next::Continue);
            }
            let event: SlackMessageEvent = match serde_json::from_value(event) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Skipping malformed Slack message event: {}", e);
                    return Ok(Next::Continue);
                }
            };
            if let Some(msg) = adapter.on_native_event(&event) {
                info!(
                    "Slack message from {} in {} queued for relay",
                    msg.sender_id, msg.channel_id
                );
                relay
                    .submit(msg)
                    .await
                    .context("Relay stopped accepting Slack messages")?;
            }
        }
        other => debug!("Ignoring socket mode envelope type {}", other),
    }
    Ok(Next::Continue)
}
