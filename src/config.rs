use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
    #[serde(default)]
    pub bots: BotAccountsConfig,
    #[serde(default)]
    pub channels: Vec<ChannelPair>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DiscordConfig {
    /// Falls back to DISCORD_TOKEN when absent
    #[serde(default)]
    pub bot_token: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SlackConfig {
    /// `xoxb-` token used for the Web API. Falls back to SLACK_BOT_TOKEN.
    #[serde(default)]
    pub bot_token: Option<Secret<String>>,
    /// `xapp-` token used to open socket mode connections. Falls back to SLACK_APP_TOKEN.
    #[serde(default)]
    pub app_token: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Maximum queued messages per direction before producers wait
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Delay before a dropped gateway/socket connection is re-established
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Side colour of the attribution embed on Discord
    #[serde(default = "default_embed_color")]
    pub embed_color: u32,
}

/// Accounts whose messages are never relayed (other bots, integrations).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BotAccountsConfig {
    #[serde(default)]
    pub discord: Vec<String>,
    #[serde(default)]
    pub slack: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelPair {
    pub discord: String,
    pub slack: String,
}

/// One person known on either or both platforms.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct UserEntry {
    #[serde(default)]
    pub discord: Option<String>,
    #[serde(default)]
    pub slack: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Tokens required to talk to both platforms, after environment fallback.
pub struct Credentials {
    pub discord_token: Secret<String>,
    pub slack_bot_token: Secret<String>,
    pub slack_app_token: Secret<String>,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_embed_color() -> u32 {
    0x4A154B
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        queue_capacity: default_queue_capacity(),
        reconnect_delay_secs: default_reconnect_delay_secs(),
        embed_color: default_embed_color(),
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        default_relay_config()
    }
}

fn resolve_token(
    configured: &Option<Secret<String>>,
    env_var: &str,
    what: &str,
    section: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Secret<String>> {
    if let Some(token) = configured {
        if !token.expose_secret().trim().is_empty() {
            return Ok(token.clone());
        }
    }
    match lookup(env_var) {
        Some(value) if !value.trim().is_empty() => Ok(Secret::new(value)),
        _ => anyhow::bail!("missing {}: set {} or {}", what, section, env_var),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.relay.queue_capacity == 0 {
            anyhow::bail!("relay.queue_capacity must be at least 1");
        }
        Ok(config)
    }

    /// Tokens from the file, falling back to the process environment.
    pub fn credentials(&self) -> Result<Credentials> {
        self.credentials_with(&|key| std::env::var(key).ok())
    }

    pub fn credentials_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Credentials> {
        Ok(Credentials {
            discord_token: resolve_token(
                &self.discord.bot_token,
                "DISCORD_TOKEN",
                "Discord bot token",
                "[discord].bot_token",
                lookup,
            )?,
            slack_bot_token: resolve_token(
                &self.slack.bot_token,
                "SLACK_BOT_TOKEN",
                "Slack bot token",
                "[slack].bot_token",
                lookup,
            )?,
            slack_app_token: resolve_token(
                &self.slack.app_token,
                "SLACK_APP_TOKEN",
                "Slack app-level token",
                "[slack].app_token",
                lookup,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
[discord]
bot_token = "discord-secret"

[slack]
bot_token = "xoxb-1"

[relay]
queue_capacity = 8
embed_color = 0x00FF00

[bots]
slack = ["B01"]

[[channels]]
discord = "1001"
slack = "C01"

[[users]]
discord = "111"
slack = "U123"
name = "Alice"

[[users]]
slack = "U999"
name = "Tutor"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.relay.queue_capacity, 8);
        assert_eq!(config.relay.embed_color, 0x00FF00);
        assert_eq!(config.relay.reconnect_delay_secs, 5);
        assert_eq!(config.bots.slack, vec!["B01".to_string()]);
        assert!(config.bots.discord.is_empty());
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.users.len(), 2);
        assert!(config.users[1].discord.is_none());
    }

    #[test]
    fn test_shipped_example_parses() {
        let config = Config::parse(include_str!("../relay.toml.example")).unwrap();
        assert_eq!(config.relay.embed_color, 0x4A154B);
        assert_eq!(config.users[0].name.as_deref(), Some("Alice"));
        assert!(crate::mapper::Mapper::from_config(&config).is_ok());
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.relay.queue_capacity, 256);
        assert!(config.channels.is_empty());
        assert!(config.discord.bot_token.is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::parse("[relay]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_credentials_fall_back_to_env() {
        let config = Config::parse(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [("SLACK_APP_TOKEN", "xapp-1")].into_iter().collect();
        let creds = config
            .credentials_with(&|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(creds.discord_token.expose_secret(), "discord-secret");
        assert_eq!(creds.slack_app_token.expose_secret(), "xapp-1");
    }

    #[test]
    fn test_missing_credential_names_the_item() {
        let config = Config::parse(SAMPLE).unwrap();
        let err = config.credentials_with(&|_| None).err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("Slack app-level token"));
        assert!(msg.contains("SLACK_APP_TOKEN"));
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[relay\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));

        let missing = Config::load(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }
}
