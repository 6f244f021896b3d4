use chrono::{DateTime, Utc};

/// The two chat platforms this bridge connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Discord,
    Slack,
}

impl Platform {
    /// The platform on the other side of the bridge
    pub fn opposite(self) -> Self {
        match self {
            Platform::Discord => Platform::Slack,
            Platform::Slack => Platform::Discord,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Discord => write!(f, "discord"),
            Platform::Slack => write!(f, "slack"),
        }
    }
}

/// One of the two one-way relay lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    DiscordToSlack,
    SlackToDiscord,
}

impl Direction {
    /// Lane carrying messages that originate on `origin`
    pub fn from_origin(origin: Platform) -> Self {
        match origin {
            Platform::Discord => Direction::DiscordToSlack,
            Platform::Slack => Direction::SlackToDiscord,
        }
    }

    pub fn source(self) -> Platform {
        match self {
            Direction::DiscordToSlack => Platform::Discord,
            Direction::SlackToDiscord => Platform::Slack,
        }
    }

    pub fn target(self) -> Platform {
        self.source().opposite()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source(), self.target())
    }
}

/// A chat message in platform-neutral form.
///
/// Every field is always populated. `sender_id` and `channel_id` stay in the
/// origin platform's id space; the receiving adapter maps them on send.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    /// Text body, possibly empty
    pub content: String,
    /// Origin-native author id
    pub sender_id: String,
    /// Origin-native channel id
    pub channel_id: String,
    /// Platform the message was posted on
    pub origin: Platform,
    /// Link back to the source message, for attribution display
    pub message_url: Option<String>,
    /// Author display name as reported by the origin platform
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RelayMessage {
    pub fn new(
        origin: Platform,
        sender_id: impl Into<String>,
        channel_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_id: sender_id.into(),
            channel_id: channel_id.into(),
            origin,
            message_url: None,
            sender_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.message_url = url;
        self
    }

    pub fn with_sender_name(mut self, name: Option<String>) -> Self {
        self.sender_name = name;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Lane this message travels on
    pub fn direction(&self) -> Direction {
        Direction::from_origin(self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_follows_origin() {
        let msg = RelayMessage::new(Platform::Slack, "U1", "C1", "hi");
        assert_eq!(msg.direction(), Direction::SlackToDiscord);
        assert_eq!(msg.direction().target(), Platform::Discord);
        assert_eq!(Direction::DiscordToSlack.to_string(), "discord->slack");
    }
}
