use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{DiscordApi, DiscordChannel, DiscordUser, OutgoingMessage};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Discord REST client authenticated as the bot user.
pub struct DiscordHttp {
    client: reqwest::Client,
    token: Secret<String>,
    base_url: String,
}

impl DiscordHttp {
    pub fn new(token: Secret<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: DISCORD_API_BASE.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token.expose_secret())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Discord GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .with_context(|| format!("Failed to send request to Discord: {}", path))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord API error ({}): {}", status, error_body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Discord response: {}", path))
    }
}

#[async_trait]
impl DiscordApi for DiscordHttp {
    async fn fetch_channel(&self, channel_id: &str) -> Result<DiscordChannel> {
        self.get(&format!("/channels/{}", channel_id)).await
    }

    async fn fetch_user(&self, user_id: &str) -> Result<DiscordUser> {
        self.get(&format!("/users/{}", user_id)).await
    }

    async fn create_message(&self, channel_id: &str, message: &OutgoingMessage) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        debug!("Discord POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(message)
            .send()
            .await
            .context("Failed to send message to Discord")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord API error ({}): {}", status, error_body);
        }

        Ok(())
    }
}
