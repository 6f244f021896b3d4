use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{PostMessage, SlackApi, SlackChannel, SlackIdentity, SlackUser};

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Slack Web API client.
pub struct SlackWeb {
    client: reqwest::Client,
    bot_token: Secret<String>,
    base_url: String,
}

/// Check the `ok` flag every Web API response carries.
fn check_ok(method: &str, body: Value) -> Result<Value> {
    if body["ok"].as_bool() == Some(true) {
        return Ok(body);
    }
    let error = body["error"].as_str().unwrap_or("unknown_error");
    anyhow::bail!("Slack API error in {}: {}", method, error)
}

fn field<T: for<'de> Deserialize<'de>>(method: &str, body: &mut Value, name: &str) -> Result<T> {
    serde_json::from_value(body[name].take())
        .with_context(|| format!("Failed to parse `{}` from Slack {} response", name, method))
}

impl SlackWeb {
    pub fn new(bot_token: Secret<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            base_url: SLACK_API_BASE.to_string(),
        }
    }

    async fn call(&self, method: &str, token: &Secret<String>, request: reqwest::RequestBuilder) -> Result<Value> {
        debug!("Slack API call: {}", method);

        let response = request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .with_context(|| format!("Failed to send request to Slack: {}", method))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack API error ({}) in {}: {}", status, method, error_body);
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack response: {}", method))?;
        check_ok(method, body)
    }

    async fn get(&self, method: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = self
            .client
            .get(format!("{}/{}", self.base_url, method))
            .query(query);
        self.call(method, &self.bot_token, request).await
    }

    /// `auth.test`: the bot's own user id, bot id and workspace URL
    pub async fn auth_test(&self) -> Result<SlackIdentity> {
        let method = "auth.test";
        let request = self.client.post(format!("{}/{}", self.base_url, method));
        let body = self.call(method, &self.bot_token, request).await?;
        serde_json::from_value(body).context("Failed to parse Slack auth.test response")
    }

    /// `apps.connections.open`: a fresh socket mode websocket URL
    pub async fn open_connection(&self, app_token: &Secret<String>) -> Result<String> {
        let method = "apps.connections.open";
        let request = self.client.post(format!("{}/{}", self.base_url, method));
        let mut body = self.call(method, app_token, request).await?;
        field(method, &mut body, "url")
    }
}

#[async_trait]
impl SlackApi for SlackWeb {
    async fn conversation_info(&self, channel_id: &str) -> Result<SlackChannel> {
        let method = "conversations.info";
        let mut body = self.get(method, &[("channel", channel_id)]).await?;
        field(method, &mut body, "channel")
    }

    async fn user_info(&self, user_id: &str) -> Result<SlackUser> {
        let method = "users.info";
        let mut body = self.get(method, &[("user", user_id)]).await?;
        field(method, &mut body, "user")
    }

    async fn post_message(&self, message: &PostMessage) -> Result<()> {
        let method = "chat.postMessage";
        let request = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(message);
        self.call(method, &self.bot_token, request).await?;
        Ok(())
    }
}
