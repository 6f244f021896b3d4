//! Minimal Discord gateway client: identify, heartbeat, and forward
//! `MESSAGE_CREATE` events. No resume or sharding; a dropped connection is
//! re-established from scratch after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DiscordAdapter, DiscordMessage};
use crate::relay::RelayHandle;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "relaybot",
                "device": "relaybot"
            }
        }
    })
}

fn heartbeat_payload(seq: Option<u64>) -> Message {
    Message::Text(json!({ "op": OP_HEARTBEAT, "d": seq }).to_string().into())
}

/// Keep a gateway session open until `shutdown` fires, reconnecting on failure.
pub async fn run(
    adapter: Arc<DiscordAdapter>,
    token: Secret<String>,
    relay: RelayHandle,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    info!("Starting Discord gateway listener...");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = run_session(&adapter, &token, &relay) => match result {
                Ok(()) => info!("Discord gateway session ended, reconnecting"),
                Err(e) => error!("Discord gateway error: {:#}", e),
            },
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    info!("Discord gateway listener stopped");
}

async fn run_session(
    adapter: &DiscordAdapter,
    token: &Secret<String>,
    relay: &RelayHandle,
) -> Result<()> {
    let (ws, _) = connect_async(GATEWAY_URL)
        .await
        .context("Failed to connect to Discord gateway")?;
    let (mut sink, mut stream) = ws.split();

    let hello = loop {
        let frame = stream
            .next()
            .await
            .context("Discord gateway closed before hello")??;
        if let Message::Text(text) = frame {
            let payload: GatewayPayload =
                serde_json::from_str(text.as_str()).context("Malformed gateway frame")?;
            break payload;
        }
    };
    if hello.op != OP_HELLO {
        anyhow::bail!("Expected gateway hello, got op {}", hello.op);
    }
    let period = hello.d["heartbeat_interval"]
        .as_u64()
        .map(Duration::from_millis)
        .context("Gateway hello without heartbeat_interval")?;

    sink.send(Message::Text(
        identify_payload(token.expose_secret()).to_string().into(),
    ))
    .await
    .context("Failed to identify with Discord gateway")?;

    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut seq: Option<u64> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                sink.send(heartbeat_payload(seq)).await.context("Failed to send heartbeat")?;
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let text = match frame.context("Discord gateway read failed")? {
                    Message::Text(text) => text,
                    Message::Close(reason) => {
                        info!("Discord gateway closed: {:?}", reason);
                        return Ok(());
                    }
                    _ => continue,
                };

                let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Skipping malformed gateway frame: {}", e);
                        continue;
                    }
                };
                if payload.s.is_some() {
                    seq = payload.s;
                }

                match payload.op {
                    OP_DISPATCH => {
                        let event_type = payload.t.as_deref().unwrap_or_default();
                        handle_dispatch(adapter, relay, event_type, payload.d).await?;
                    }
                    OP_HEARTBEAT => {
                        sink.send(heartbeat_payload(seq)).await.context("Failed to send heartbeat")?;
                    }
                    OP_RECONNECT => {
                        info!("Discord gateway requested reconnect");
                        return Ok(());
                    }
                    OP_INVALID_SESSION => {
                        warn!("Discord gateway reported an invalid session");
                        return Ok(());
                    }
                    OP_HEARTBEAT_ACK => {}
                    other => debug!("Ignoring gateway op {}", other),
                }
            }
        }
    }
}

/// Handle one dispatch event. Only a closed relay is an error.
async fn handle_dispatch(
    adapter: &DiscordAdapter,
    relay: &RelayHandle,
    event_type: &str,
    data: Value,
) -> Result<()> {
    match event_type {
        "READY" => {
            if let Some(id) = data["user"]["id"].as_str() {
                info!("Discord gateway ready as user {}", id);
                adapter.set_bot_user_id(id);
            }
        }
        "MESSAGE_CREATE" => {
            let event: DiscordMessage = match serde_json::from_value(data) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Skipping malformed MESSAGE_CREATE: {}", e);
                    return Ok(());
                }
            };
            if let Some(msg) = adapter.on_native_event(&event) {
                info!(
                    "Discord message from {} in {} queued for relay",
                    msg.sender_id, msg.channel_id
                );
                relay
                    .submit(msg)
                    .await
                    .context("Relay stopped accepting Discord messages")?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelPair, Config};
    use crate::mapper::Mapper;
    use crate::platform::discord::{DiscordApi, DiscordChannel, DiscordUser, OutgoingMessage};
    use async_trait::async_trait;

    struct NoopDiscord;

    #[async_trait]
    impl DiscordApi for NoopDiscord {
        async fn fetch_channel(&self, _channel_id: &str) -> Result<DiscordChannel> {
            anyhow::bail!("unused")
        }

        async fn fetch_user(&self, _user_id: &str) -> Result<DiscordUser> {
            anyhow::bail!("unused")
        }

        async fn create_message(&self, _channel_id: &str, _message: &OutgoingMessage) -> Result<()> {
            anyhow::bail!("unused")
        }
    }

    fn adapter() -> DiscordAdapter {
        let mut config = Config::default();
        config.channels.push(ChannelPair {
            discord: "1001".to_string(),
            slack: "C01".to_string(),
        });
        let mapper = Arc::new(Mapper::from_config(&config).unwrap());
        DiscordAdapter::new(Arc::new(NoopDiscord), mapper, 0).unwrap()
    }

    fn message_create(author_id: &str, content: &str) -> Value {
        json!({
            "id": "1",
            "channel_id": "1001",
            "author": { "id": author_id, "username": "user" },
            "content": content,
            "type": 0
        })
    }

    #[test]
    fn test_identify_requests_message_content() {
        let payload = identify_payload("token");
        assert_eq!(payload["op"], 2);
        let intents = payload["d"]["intents"].as_u64().unwrap();
        assert_ne!(intents & INTENT_MESSAGE_CONTENT, 0);
        assert_ne!(intents & INTENT_GUILD_MESSAGES, 0);
    }

    #[tokio::test]
    async fn test_ready_then_message_create() {
        let adapter = adapter();
        let (relay, mut lanes) = RelayHandle::bounded(4);

        handle_dispatch(&adapter, &relay, "READY", json!({ "user": { "id": "900" } }))
            .await
            .unwrap();
        handle_dispatch(&adapter, &relay, "MESSAGE_CREATE", message_create("900", "own echo"))
            .await
            .unwrap();
        handle_dispatch(&adapter, &relay, "MESSAGE_CREATE", message_create("12", "hello"))
            .await
            .unwrap();
        handle_dispatch(&adapter, &relay, "MESSAGE_CREATE", json!({ "nonsense": true }))
            .await
            .unwrap();

        let queued = lanes.to_slack.try_recv().unwrap();
        assert_eq!(queued.content, "hello");
        assert!(lanes.to_slack.try_recv().is_err());
        assert!(lanes.to_discord.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_relay_is_an_error() {
        let adapter = adapter();
        let (relay, lanes) = RelayHandle::bounded(4);
        drop(lanes);

        let result =
            handle_dispatch(&adapter, &relay, "MESSAGE_CREATE", message_create("12", "hi")).await;
        assert!(result.is_err());
    }
}
