pub mod gateway;
pub mod http;

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mapper::Mapper;
use crate::platform::slack;
use crate::platform::{
    resolve_author, rewrite_mentions, split_message, Author, HandleCache, PlatformAdapter,
    SendError,
};
use crate::relay::{Platform, RelayMessage};

/// Discord rejects message content longer than this
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// `<@123>` and the legacy nickname form `<@!123>`
const MENTION_PATTERN: &str = r"<@!?(\d+)>";

const MESSAGE_TYPE_DEFAULT: u8 = 0;
const MESSAGE_TYPE_REPLY: u8 = 19;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl DiscordUser {
    pub fn display_name(&self) -> &str {
        self.global_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }

    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            format!(
                "https://cdn.discordapp.com/avatars/{}/{}.png",
                self.id, hash
            )
        })
    }
}

/// A `MESSAGE_CREATE` payload from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub author: Option<DiscordUser>,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub name: Option<String>,
}

impl DiscordChannel {
    /// Guild text and announcement channels accept plain messages
    pub fn is_text(&self) -> bool {
        matches!(self.kind, 0 | 5)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedFooter {
    pub text: String,
}

/// Attribution card shown with the first chunk of a relayed message.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Embed {
    pub author: EmbedAuthor,
    pub color: u32,
    pub timestamp: String,
    pub footer: EmbedFooter,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

/// Body of `POST /channels/{id}/messages`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    pub allowed_mentions: AllowedMentions,
}

/// The Discord REST calls the adapter depends on.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn fetch_channel(&self, channel_id: &str) -> Result<DiscordChannel>;
    async fn fetch_user(&self, user_id: &str) -> Result<DiscordUser>;
    async fn create_message(&self, channel_id: &str, message: &OutgoingMessage) -> Result<()>;
}

pub struct DiscordAdapter {
    api: Arc<dyn DiscordApi>,
    mapper: Arc<Mapper>,
    channels: HandleCache<DiscordChannel>,
    mention_pattern: Regex,
    bot_user_id: OnceLock<String>,
    embed_color: u32,
}

impl DiscordAdapter {
    pub fn new(api: Arc<dyn DiscordApi>, mapper: Arc<Mapper>, embed_color: u32) -> Result<Self> {
        Ok(Self {
            api,
            mapper,
            channels: HandleCache::new(),
            mention_pattern: Regex::new(MENTION_PATTERN)?,
            bot_user_id: OnceLock::new(),
            embed_color,
        })
    }

    /// Record the bot's own user id, learned from the gateway `READY` event
    pub fn set_bot_user_id(&self, id: &str) {
        if self.bot_user_id.set(id.to_string()).is_err() {
            debug!("Discord bot user id already known");
        }
    }

    fn is_self(&self, user_id: &str) -> bool {
        self.bot_user_id.get().is_some_and(|id| id == user_id)
            || self.mapper.is_bot_account(Platform::Discord, user_id)
    }

    /// Translate a gateway message into a relay message.
    ///
    /// Returns `None` for our own messages, bot authors, system
    /// messages and payloads without an author.
    pub fn on_native_event(&self, event: &DiscordMessage) -> Option<RelayMessage> {
        let Some(author) = event.author.as_ref() else {
            debug!("Discord message {} has no author, skipping", event.id);
            return None;
        };
        if event.channel_id.is_empty() || author.id.is_empty() {
            debug!("Discord message {} is missing ids, skipping", event.id);
            return None;
        }
        if author.bot || self.is_self(&author.id) {
            return None;
        }
        if event.kind != MESSAGE_TYPE_DEFAULT && event.kind != MESSAGE_TYPE_REPLY {
            debug!("Skipping Discord system message of type {}", event.kind);
            return None;
        }

        // Relayed text lands on Slack, which reads `<`, `>` and `&` as markup
        let content = rewrite_mentions(
            &event.content,
            &self.mention_pattern,
            &self.mapper,
            Platform::Discord,
            &slack::escape,
        );

        let url = format!(
            "https://discord.com/channels/{}/{}/{}",
            event.guild_id.as_deref().unwrap_or("@me"),
            event.channel_id,
            event.id
        );

        Some(
            RelayMessage::new(Platform::Discord, &author.id, &event.channel_id, content)
                .with_url(Some(url))
                .with_sender_name(Some(author.display_name().to_string()))
                .with_timestamp(event.timestamp.unwrap_or_else(Utc::now)),
        )
    }

    async fn resolve_channel(&self, msg: &RelayMessage) -> Result<DiscordChannel, SendError> {
        let target_id = self
            .mapper
            .resolve_channel(msg.origin, &msg.channel_id)
            .ok_or_else(|| SendError::ChannelUnresolvable {
                channel_id: msg.channel_id.clone(),
                reason: "no channel mapping".to_string(),
            })?;

        self.channels
            .get_or_fetch(target_id, || async move {
                let channel = self.api.fetch_channel(target_id).await.map_err(|e| {
                    SendError::ChannelUnresolvable {
                        channel_id: target_id.to_string(),
                        reason: format!("{:#}", e),
                    }
                })?;
                if !channel.is_text() {
                    return Err(SendError::ChannelUnresolvable {
                        channel_id: target_id.to_string(),
                        reason: format!("channel type {} is not a text channel", channel.kind),
                    });
                }
                Ok::<_, SendError>(channel)
            })
            .await
    }

    fn attribution(&self, msg: &RelayMessage, author: &Author) -> Embed {
        Embed {
            author: EmbedAuthor {
                name: author.name.clone(),
                url: msg.message_url.clone(),
                icon_url: author.avatar_url.clone(),
            },
            color: self.embed_color,
            timestamp: msg.timestamp.to_rfc3339(),
            footer: EmbedFooter {
                text: format!("via {}", msg.origin),
            },
        }
    }
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), SendError> {
        let channel = self.resolve_channel(msg).await?;

        let author = resolve_author(&self.mapper, msg, |user_id| async move {
            let user = self.api.fetch_user(&user_id).await?;
            Ok::<_, anyhow::Error>(Author {
                name: user.display_name().to_string(),
                avatar_url: user.avatar_url(),
            })
        })
        .await;

        let chunks = split_message(&msg.content, DISCORD_MESSAGE_LIMIT);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let embeds = if index == 0 {
                vec![self.attribution(msg, &author)]
            } else {
                Vec::new()
            };
            let outgoing = OutgoingMessage {
                content: chunk,
                embeds,
                allowed_mentions: AllowedMentions {
                    parse: vec!["users".to_string()],
                },
            };
            self.api
                .create_message(&channel.id, &outgoing)
                .await
                .map_err(|e| SendError::TransportError {
                    chunk: index + 1,
                    total,
                    reason: format!("{:#}", e),
                })?;
        }

        debug!(
            "Posted {} chunk(s) to Discord channel #{} as {}",
            total,
            channel.name.as_deref().unwrap_or(&channel.id),
            author.name
        );
        Ok(())
    }
}
