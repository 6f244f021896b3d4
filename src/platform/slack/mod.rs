pub mod socket;
pub mod web;

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mapper::Mapper;
use crate::platform::{
    resolve_author, rewrite_mentions, split_message, Author, HandleCache, PlatformAdapter,
    SendError,
};
use crate::relay::{Platform, RelayMessage};

/// Slack truncates longer `text` fields, so chunks stay under this
pub const SLACK_MESSAGE_LIMIT: usize = 4000;

/// `<@U123>` and the labelled form `<@U123|name>`
const MENTION_PATTERN: &str = r"<@([UW][A-Z0-9]+)(?:\|[^>]*)?>";

/// A `message` event from the Events API.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackMessageEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub image_72: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub profile: SlackProfile,
}

impl SlackUser {
    pub fn display_name(&self) -> &str {
        [&self.profile.display_name, &self.profile.real_name]
            .into_iter()
            .find(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }
}

/// Who the bot is, from `auth.test`.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackIdentity {
    pub user_id: String,
    #[serde(default)]
    pub bot_id: Option<String>,
    /// Workspace URL, e.g. `https://team.slack.com/`
    #[serde(default)]
    pub url: String,
}

/// Arguments of `chat.postMessage`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostMessage {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub unfurl_links: bool,
}

/// The Slack Web API calls the adapter depends on.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn conversation_info(&self, channel_id: &str) -> Result<SlackChannel>;
    async fn user_info(&self, user_id: &str) -> Result<SlackUser>;
    async fn post_message(&self, message: &PostMessage) -> Result<()>;
}

/// Escape the three characters Slack reads as markup, so text posts literally
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Undo Slack's escaping of the three control characters
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = micros.parse().ok()?;
    DateTime::from_timestamp(secs, micros.saturating_mul(1000))
}

pub struct SlackAdapter {
    api: Arc<dyn SlackApi>,
    mapper: Arc<Mapper>,
    channels: HandleCache<SlackChannel>,
    mention_pattern: Regex,
    identity: OnceLock<SlackIdentity>,
}

impl SlackAdapter {
    pub fn new(api: Arc<dyn SlackApi>, mapper: Arc<Mapper>) -> Result<Self> {
        Ok(Self {
            api,
            mapper,
            channels: HandleCache::new(),
            mention_pattern: Regex::new(MENTION_PATTERN)?,
            identity: OnceLock::new(),
        })
    }

    pub fn set_identity(&self, identity: SlackIdentity) {
        if self.identity.set(identity).is_err() {
            debug!("Slack bot identity already known");
        }
    }

    fn is_self(&self, event: &SlackMessageEvent) -> bool {
        let own = self.identity.get();
        let user = event.user.as_deref();
        let bot = event.bot_id.as_deref();

        own.is_some_and(|id| user == Some(id.user_id.as_str()))
            || own.is_some_and(|id| bot.is_some() && bot == id.bot_id.as_deref())
            || user.is_some_and(|u| self.mapper.is_bot_account(Platform::Slack, u))
            || bot.is_some_and(|b| self.mapper.is_bot_account(Platform::Slack, b))
    }

    fn permalink(&self, channel: &str, ts: &str) -> Option<String> {
        let base = self.identity.get().map(|id| id.url.as_str())?;
        if base.is_empty() {
            return None;
        }
        Some(format!(
            "{}/archives/{}/p{}",
            base.trim_end_matches('/'),
            channel,
            ts.replace('.', "")
        ))
    }

    /// Translate a Slack message event into a relay message.
    ///
    /// Returns `None` for our own posts, configured bot accounts, message
    /// subtypes (edits, deletes, joins, bot posts) and events without a user
    /// or channel.
    pub fn on_native_event(&self, event: &SlackMessageEvent) -> Option<RelayMessage> {
        if event.kind != "message" || event.subtype.is_some() {
            return None;
        }
        if self.is_self(event) {
            return None;
        }
        let (Some(user), Some(channel)) = (event.user.as_deref(), event.channel.as_deref()) else {
            debug!("Slack message event without user or channel, skipping");
            return None;
        };

        let raw = event.text.as_deref().unwrap_or_default();
        let content = rewrite_mentions(
            raw,
            &self.mention_pattern,
            &self.mapper,
            Platform::Slack,
            &unescape,
        );

        let ts = event.ts.as_deref();
        Some(
            RelayMessage::new(Platform::Slack, user, channel, content)
                .with_url(ts.and_then(|ts| self.permalink(channel, ts)))
                .with_timestamp(ts.and_then(parse_ts).unwrap_or_else(Utc::now)),
        )
    }

    async fn resolve_channel(&self, msg: &RelayMessage) -> Result<SlackChannel, SendError> {
        let target_id = self
            .mapper
            .resolve_channel(msg.origin, &msg.channel_id)
            .ok_or_else(|| SendError::ChannelUnresolvable {
                channel_id: msg.channel_id.clone(),
                reason: "no channel mapping".to_string(),
            })?;

        self.channels
            .get_or_fetch(target_id, || async move {
                let channel = self.api.conversation_info(target_id).await.map_err(|e| {
                    SendError::ChannelUnresolvable {
                        channel_id: target_id.to_string(),
                        reason: format!("{:#}", e),
                    }
                })?;
                if channel.is_archived {
                    return Err(SendError::ChannelUnresolvable {
                        channel_id: target_id.to_string(),
                        reason: "channel is archived".to_string(),
                    });
                }
                Ok::<_, SendError>(channel)
            })
            .await
    }
}

#[async_trait]
impl PlatformAdapter for SlackAdapter {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), SendError> {
        let channel = self.resolve_channel(msg).await?;

        let author = resolve_author(&self.mapper, msg, |user_id| async move {
            let user = self.api.user_info(&user_id).await?;
            if user.deleted {
                anyhow::bail!("account {} is deactivated", user.id);
            }
            Ok::<_, anyhow::Error>(Author {
                name: user.display_name().to_string(),
                avatar_url: user.profile.image_72.clone(),
            })
        })
        .await;

        let chunks = split_message(&msg.content, SLACK_MESSAGE_LIMIT);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let post = PostMessage {
                channel: channel.id.clone(),
                text: chunk,
                username: Some(author.name.clone()),
                icon_url: author.avatar_url.clone(),
                unfurl_links: false,
            };
            self.api
                .post_message(&post)
                .await
                .map_err(|e| SendError::TransportError {
                    chunk: index + 1,
                    total,
                    reason: format!("{:#}", e),
                })?;
        }

        debug!(
            "Posted {} chunk(s) to Slack channel #{} as {}",
            total,
            channel.name.as_deref().unwrap_or(&channel.id),
            author.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelPair, Config, UserEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeSlack {
        posted: Mutex<Vec<PostMessage>>,
        channel_lookups: AtomicUsize,
        fail_channel: bool,
    }

    #[async_trait]
    impl SlackApi for FakeSlack {
        async fn conversation_info(&self, channel_id: &str) -> Result<SlackChannel> {
            self.channel_lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail_channel {
                anyhow::bail!("Slack API error: channel_not_found");
            }
            Ok(SlackChannel {
                id: channel_id.to_string(),
                name: Some("general".to_string()),
                is_archived: false,
            })
        }

        async fn user_info(&self, user_id: &str) -> Result<SlackUser> {
            if user_id == "UGONE" {
                anyhow::bail!("Slack API error: user_not_found");
            }
            Ok(SlackUser {
                id: user_id.to_string(),
                name: "alice".to_string(),
                deleted: false,
                profile: SlackProfile {
                    display_name: String::new(),
                    real_name: "Alice Real".to_string(),
                    image_72: Some("https://example.com/a.png".to_string()),
                },
            })
        }

        async fn post_message(&self, message: &PostMessage) -> Result<()> {
            self.posted.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn mapper() -> Arc<Mapper> {
        let mut config = Config::default();
        config.channels.push(ChannelPair {
            discord: "1001".to_string(),
            slack: "C01".to_string(),
        });
        config.users.push(UserEntry {
            discord: Some("D456".to_string()),
            slack: Some("U123".to_string()),
            name: Some("Alice".to_string()),
        });
        config.users.push(UserEntry {
            discord: Some("222".to_string()),
            slack: Some("UGONE".to_string()),
            name: None,
        });
        config.bots.slack.push("B0INTEGRATION".to_string());
        Arc::new(Mapper::from_config(&config).unwrap())
    }

    fn adapter(api: Arc<FakeSlack>) -> SlackAdapter {
        let adapter = SlackAdapter::new(api, mapper()).unwrap();
        adapter.set_identity(SlackIdentity {
            user_id: "UBOT".to_string(),
            bot_id: Some("BBOT".to_string()),
            url: "https://team.slack.com/".to_string(),
        });
        adapter
    }

    fn event(user: Option<&str>, text: &str) -> SlackMessageEvent {
        SlackMessageEvent {
            kind: "message".to_string(),
            subtype: None,
            user: user.map(str::to_string),
            bot_id: None,
            text: Some(text.to_string()),
            channel: Some("C01".to_string()),
            ts: Some("1700000000.123456".to_string()),
        }
    }

    #[test]
    fn test_mentions_rewritten_for_discord() {
        let adapter = adapter(Arc::new(FakeSlack::default()));
        let msg = adapter
            .on_native_event(&event(Some("U777"), "hello <@U123>"))
            .unwrap();
        assert_eq!(msg.content, "hello <@D456>");

        let msg = adapter
            .on_native_event(&event(Some("U777"), "hello <@U999> &amp; bye"))
            .unwrap();
        assert_eq!(msg.content, "hello <@U999> & bye");
    }

    #[test]
    fn test_event_fields() {
        let adapter = adapter(Arc::new(FakeSlack::default()));
        let msg = adapter.on_native_event(&event(Some("U777"), "hi")).unwrap();
        assert_eq!(msg.origin, Platform::Slack);
        assert_eq!(msg.sender_id, "U777");
        assert_eq!(msg.channel_id, "C01");
        assert_eq!(
            msg.message_url.as_deref(),
            Some("https://team.slack.com/archives/C01/p1700000000123456")
        );
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_self_and_bot_messages_ignored() {
        let adapter = adapter(Arc::new(FakeSlack::default()));
        assert!(adapter.on_native_event(&event(Some("UBOT"), "echo")).is_none());

        let mut own_post = event(Some("U777"), "echo");
        own_post.bot_id = Some("BBOT".to_string());
        assert!(adapter.on_native_event(&own_post).is_none());

        let mut integration = event(None, "deploy finished");
        integration.bot_id = Some("B0INTEGRATION".to_string());
        assert!(adapter.on_native_event(&integration).is_none());
    }

    #[test]
    fn test_subtypes_and_malformed_events_ignored() {
        let adapter = adapter(Arc::new(FakeSlack::default()));
        let mut edited = event(Some("U777"), "edited");
        edited.subtype = Some("message_changed".to_string());
        assert!(adapter.on_native_event(&edited).is_none());

        assert!(adapter.on_native_event(&event(None, "who?")).is_none());

        let mut reaction = event(Some("U777"), "");
        reaction.kind = "reaction_added".to_string();
        assert!(adapter.on_native_event(&reaction).is_none());
    }

    #[tokio::test]
    async fn test_send_uses_mapped_profile() {
        let api = Arc::new(FakeSlack::default());
        let adapter = adapter(api.clone());
        let msg = RelayMessage::new(Platform::Discord, "D456", "1001", "hi from discord");

        adapter.send(&msg).await.unwrap();
        adapter.send(&msg).await.unwrap();

        let posted = api.posted.lock().await;
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].channel, "C01");
        assert_eq!(posted[0].username.as_deref(), Some("Alice Real"));
        assert_eq!(posted[0].icon_url.as_deref(), Some("https://example.com/a.png"));
        assert_eq!(api.channel_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_escaped_discord_text_posts_literally() {
        let api = Arc::new(FakeSlack::default());
        let adapter = adapter(api.clone());
        let content = escape("<!channel> a < b");
        let msg = RelayMessage::new(Platform::Discord, "D456", "1001", content);

        adapter.send(&msg).await.unwrap();

        let posted = api.posted.lock().await;
        assert_eq!(posted[0].text, "&lt;!channel&gt; a &lt; b");
    }

    #[tokio::test]
    async fn test_unfetchable_user_falls_back_to_anonymous() {
        let api = Arc::new(FakeSlack::default());
        let adapter = adapter(api.clone());
        let msg = RelayMessage::new(Platform::Discord, "222", "1001", "ghost");

        adapter.send(&msg).await.unwrap();

        let posted = api.posted.lock().await;
        assert_eq!(posted[0].username.as_deref(), Some("Anonymous"));
        assert_eq!(posted[0].text, "ghost");
    }

    #[tokio::test]
    async fn test_channel_lookup_failure_not_cached() {
        let api = Arc::new(FakeSlack {
            fail_channel: true,
            ..Default::default()
        });
        let adapter = adapter(api.clone());
        let msg = RelayMessage::new(Platform::Discord, "D456", "1001", "hi");

        for _ in 0..2 {
            assert!(matches!(
                adapter.send(&msg).await,
                Err(SendError::ChannelUnresolvable { .. })
            ));
        }
        assert_eq!(api.channel_lookups.load(Ordering::SeqCst), 2);
        assert!(api.posted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_long_message_chunked_for_slack() {
        let api = Arc::new(FakeSlack::default());
        let adapter = adapter(api.clone());
        let msg = RelayMessage::new(Platform::Discord, "D456", "1001", "z".repeat(9000));

        adapter.send(&msg).await.unwrap();

        let posted = api.posted.lock().await;
        let lengths: Vec<usize> = posted.iter().map(|p| p.text.len()).collect();
        assert_eq!(lengths, vec![4000, 4000, 1000]);
        assert!(posted.iter().all(|p| p.username.as_deref() == Some("Alice Real")));
    }

    #[test]
    fn test_escape_neutralises_markup() {
        assert_eq!(escape("<!channel> a < b & c"), "&lt;!channel&gt; a &lt; b &amp; c");
        assert_eq!(unescape(&escape("<a & b>")), "<a & b>");
    }

    #[test]
    fn test_parse_ts() {
        let ts = parse_ts("1700000000.000500").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 500);
        assert!(parse_ts("not-a-ts").is_none());
    }
}
