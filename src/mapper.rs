use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::relay::Platform;

/// Result of looking up a user on the platform they posted from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MappedIdentity {
    /// The same person's id on the opposite platform
    pub target_id: Option<String>,
    /// Configured display name for the person
    pub display_name: Option<String>,
}

/// One lookup table per platform, keyed by the platform-native id.
#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, MappedIdentity>,
    channels: HashMap<String, String>,
    bots: HashSet<String>,
}

/// Read-only user, channel and bot-account lookups for both platforms.
///
/// Built once at startup and shared behind an `Arc`; there is no way to
/// mutate it afterwards.
#[derive(Debug, Default)]
pub struct Mapper {
    discord: Tables,
    slack: Tables,
}

fn insert_unique<V>(
    table: &mut HashMap<String, V>,
    key: &str,
    value: V,
    platform: Platform,
    kind: &str,
) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("empty {} {} id in mapping", platform, kind);
    }
    if table.insert(key.to_string(), value).is_some() {
        anyhow::bail!("duplicate {} {} id in mapping: {}", platform, kind, key);
    }
    Ok(())
}

impl Mapper {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.channels.is_empty() {
            anyhow::bail!("no channel pairs configured: add at least one [[channels]] entry");
        }

        let mut mapper = Mapper::default();

        for pair in &config.channels {
            let (discord, slack) = (pair.discord.trim(), pair.slack.trim());
            insert_unique(
                &mut mapper.discord.channels,
                discord,
                slack.to_string(),
                Platform::Discord,
                "channel",
            )?;
            insert_unique(
                &mut mapper.slack.channels,
                slack,
                discord.to_string(),
                Platform::Slack,
                "channel",
            )?;
        }

        for user in &config.users {
            let discord = user.discord.as_deref().map(str::trim);
            let slack = user.slack.as_deref().map(str::trim);
            if discord.is_none() && slack.is_none() {
                anyhow::bail!(
                    "user mapping {:?} has neither a discord nor a slack id",
                    user.name.as_deref().unwrap_or("<unnamed>")
                );
            }
            if let Some(id) = discord {
                let identity = MappedIdentity {
                    target_id: slack.map(str::to_string),
                    display_name: user.name.clone(),
                };
                insert_unique(&mut mapper.discord.users, id, identity, Platform::Discord, "user")?;
            }
            if let Some(id) = slack {
                let identity = MappedIdentity {
                    target_id: discord.map(str::to_string),
                    display_name: user.name.clone(),
                };
                insert_unique(&mut mapper.slack.users, id, identity, Platform::Slack, "user")?;
            }
        }

        mapper.discord.bots = config.bots.discord.iter().map(|id| id.trim().to_string()).collect();
        mapper.slack.bots = config.bots.slack.iter().map(|id| id.trim().to_string()).collect();

        info!(
            "Mapper loaded: {} channel pair(s), {} discord / {} slack user(s), {} bot account(s)",
            config.channels.len(),
            mapper.discord.users.len(),
            mapper.slack.users.len(),
            mapper.discord.bots.len() + mapper.slack.bots.len()
        );

        Ok(mapper)
    }

    fn tables(&self, platform: Platform) -> &Tables {
        match platform {
            Platform::Discord => &self.discord,
            Platform::Slack => &self.slack,
        }
    }

    /// Look up a user by their id on `platform`.
    pub fn resolve_user(&self, platform: Platform, id: &str) -> Option<&MappedIdentity> {
        self.tables(platform).users.get(id)
    }

    /// The opposite platform's channel paired with `id` on `platform`.
    pub fn resolve_channel(&self, platform: Platform, id: &str) -> Option<&str> {
        self.tables(platform).channels.get(id).map(String::as_str)
    }

    pub fn is_bot_account(&self, platform: Platform, id: &str) -> bool {
        self.tables(platform).bots.contains(id)
    }

    /// Mention target for a user id, if the person exists on the other side.
    pub fn mention_target(&self, platform: Platform, id: &str) -> Option<&str> {
        self.resolve_user(platform, id)
            .and_then(|identity| identity.target_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelPair, UserEntry};

    fn user(discord: Option<&str>, slack: Option<&str>, name: Option<&str>) -> UserEntry {
        UserEntry {
            discord: discord.map(str::to_string),
            slack: slack.map(str::to_string),
            name: name.map(str::to_string),
        }
    }

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.channels.push(ChannelPair {
            discord: "1001".to_string(),
            slack: "C01".to_string(),
        });
        config.users.push(user(Some("111"), Some("U123"), Some("Alice")));
        config.users.push(user(None, Some("U555"), Some("Tutor")));
        config.bots.slack.push("B01".to_string());
        config
    }

    #[test]
    fn test_channels_resolve_both_ways() {
        let mapper = Mapper::from_config(&sample_config()).unwrap();
        assert_eq!(mapper.resolve_channel(Platform::Discord, "1001"), Some("C01"));
        assert_eq!(mapper.resolve_channel(Platform::Slack, "C01"), Some("1001"));
        assert_eq!(mapper.resolve_channel(Platform::Slack, "C99"), None);
    }

    #[test]
    fn test_users_resolve_with_names() {
        let mapper = Mapper::from_config(&sample_config()).unwrap();
        let alice = mapper.resolve_user(Platform::Slack, "U123").unwrap();
        assert_eq!(alice.target_id.as_deref(), Some("111"));
        assert_eq!(alice.display_name.as_deref(), Some("Alice"));

        let tutor = mapper.resolve_user(Platform::Slack, "U555").unwrap();
        assert!(tutor.target_id.is_none());
        assert_eq!(mapper.mention_target(Platform::Slack, "U555"), None);
        assert_eq!(mapper.mention_target(Platform::Discord, "111"), Some("U123"));
        assert!(mapper.resolve_user(Platform::Discord, "999").is_none());
    }

    #[test]
    fn test_bot_accounts_are_per_platform() {
        let mapper = Mapper::from_config(&sample_config()).unwrap();
        assert!(mapper.is_bot_account(Platform::Slack, "B01"));
        assert!(!mapper.is_bot_account(Platform::Discord, "B01"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = sample_config();
        config.users.push(user(Some("111"), None, None));
        let err = Mapper::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate discord user id"));
    }

    #[test]
    fn test_missing_channel_pairs_rejected() {
        let err = Mapper::from_config(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("[[channels]]"));

        let mut config = sample_config();
        config.channels.clear();
        assert!(Mapper::from_config(&config).is_err());
    }

    #[test]
    fn test_empty_user_entry_rejected() {
        let mut config = sample_config();
        config.users.push(user(None, None, Some("Ghost")));
        assert!(Mapper::from_config(&config).is_err());
    }
}
