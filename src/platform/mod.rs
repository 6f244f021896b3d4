pub mod discord;
pub mod slack;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::warn;

use crate::mapper::Mapper;
use crate::relay::{Platform, RelayMessage};

/// Why a relayed message could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Target channel is unmapped, could not be fetched, or is not a text channel
    #[error("channel {channel_id} is unresolvable: {reason}")]
    ChannelUnresolvable { channel_id: String, reason: String },

    /// Mapped user has no fetchable profile; handled inside `send`
    #[error("user {user_id} could not be fetched: {reason}")]
    UserFetchFailed { user_id: String, reason: String },

    /// The platform rejected or never received a chunk
    #[error("chunk {chunk}/{total} failed to send: {reason}")]
    TransportError {
        chunk: usize,
        total: usize,
        reason: String,
    },
}

/// Capability the coordinator needs from each side of the bridge.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform this adapter delivers to
    fn platform(&self) -> Platform;

    /// Deliver a message that originated on the opposite platform.
    ///
    /// Chunks are posted in order. A failed chunk stops the message; chunks
    /// already posted stay posted.
    async fn send(&self, msg: &RelayMessage) -> Result<(), SendError>;
}

/// How the original author is shown on the receiving platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Author {
    pub fn anonymous() -> Self {
        Self {
            name: "Anonymous".to_string(),
            avatar_url: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar_url: None,
        }
    }
}

/// Work out the author to display for `msg`.
///
/// Mapped users are fetched from the receiving platform through
/// `fetch_profile`. A failed fetch is logged and falls back to the anonymous
/// identity; it never fails the send.
pub async fn resolve_author<F, Fut>(mapper: &Mapper, msg: &RelayMessage, fetch_profile: F) -> Author
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = anyhow::Result<Author>>,
{
    let Some(identity) = mapper.resolve_user(msg.origin, &msg.sender_id) else {
        return match &msg.sender_name {
            Some(name) if !name.trim().is_empty() => Author::named(name.clone()),
            _ => Author::anonymous(),
        };
    };

    match &identity.target_id {
        Some(target_id) => match fetch_profile(target_id.clone()).await {
            Ok(author) => author,
            Err(e) => {
                let err = SendError::UserFetchFailed {
                    user_id: target_id.clone(),
                    reason: format!("{:#}", e),
                };
                warn!("{}; relaying as anonymous", err);
                Author::anonymous()
            }
        },
        None => identity
            .display_name
            .clone()
            .map(Author::named)
            .unwrap_or_else(Author::anonymous),
    }
}

/// Split text into ordered chunks of at most `max_chars` characters.
///
/// A chunk ends after the last whitespace inside the limit so mention tokens
/// and words stay whole; text without whitespace is cut exactly at the limit.
/// Concatenating the chunks gives back the original text.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };
        let head = &rest[..limit];
        let cut = match head.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
            Some((pos, ws)) if pos > 0 => pos + ws.len_utf8(),
            _ => limit,
        };
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}

/// Rewrite native mention tokens into the opposite platform's `<@id>` form.
///
/// `pattern` must capture the mentioned user id in group 1. Everything except
/// the rewritten tokens passes through `escape`, so users without a
/// counterpart keep their original token as literal text.
pub fn rewrite_mentions(
    content: &str,
    pattern: &Regex,
    mapper: &Mapper,
    origin: Platform,
    escape: &dyn Fn(&str) -> String,
) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;

    for caps in pattern.captures_iter(content) {
        let Some(token) = caps.get(0) else {
            continue;
        };
        out.push_str(&escape(&content[last..token.start()]));
        match mapper.mention_target(origin, &caps[1]) {
            Some(target) => out.push_str(&format!("<@{}>", target)),
            None => out.push_str(&escape(token.as_str())),
        }
        last = token.end();
    }
    out.push_str(&escape(&content[last..]));

    out
}

/// Fetch-once cache of resolved native channel handles, keyed by native id.
pub struct HandleCache<H> {
    handles: RwLock<HashMap<String, H>>,
}

impl<H: Clone> HandleCache<H> {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached handle, or fetch and cache it. Failures are not cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, id: &str, fetch: F) -> Result<H, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        if let Some(handle) = self.handles.read().await.get(id) {
            return Ok(handle.clone());
        }

        let handle = fetch().await?;
        self.handles
            .write()
            .await
            .insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    #[cfg(test)]
    pub async fn cached_count(&self) -> usize {
        self.handles.read().await.len()
    }
}
