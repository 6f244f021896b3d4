use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mapper::Mapper;
use crate::platform::PlatformAdapter;
use crate::relay::{Direction, Platform, RelayMessage};

/// Why an enqueue attempt was refused.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// Lane is at capacity; the message is handed back for a later retry
    #[error("relay queue is full")]
    Full(RelayMessage),

    /// Coordinator has stopped and will never drain this lane
    #[error("relay coordinator has stopped")]
    Closed,

    #[error("message from {origin} cannot travel on the {direction} lane")]
    WrongDirection {
        direction: Direction,
        origin: Platform,
    },
}

/// Result of running a message through the filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Pass,
    EmptyContent,
    BotAuthor,
    UnmappedChannel,
}

/// Apply the relay filters in order: empty content, bot author, unmapped channel.
pub fn filter(mapper: &Mapper, msg: &RelayMessage) -> FilterOutcome {
    if msg.content.trim().is_empty() {
        return FilterOutcome::EmptyContent;
    }
    if mapper.is_bot_account(msg.origin, &msg.sender_id) {
        return FilterOutcome::BotAuthor;
    }
    if mapper.resolve_channel(msg.origin, &msg.channel_id).is_none() {
        return FilterOutcome::UnmappedChannel;
    }
    FilterOutcome::Pass
}

/// Per-lane counters
#[derive(Debug, Default)]
pub struct LaneStats {
    relayed: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneCounts {
    pub relayed: u64,
    pub filtered: u64,
    pub failed: u64,
}

impl LaneStats {
    pub fn snapshot(&self) -> LaneCounts {
        LaneCounts {
            relayed: self.relayed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub discord_to_slack: LaneStats,
    pub slack_to_discord: LaneStats,
}

impl RelayStats {
    pub fn lane(&self, direction: Direction) -> &LaneStats {
        match direction {
            Direction::DiscordToSlack => &self.discord_to_slack,
            Direction::SlackToDiscord => &self.slack_to_discord,
        }
    }
}

/// Producer side of the two relay lanes. Cheap to clone; one per listener.
#[derive(Clone)]
pub struct RelayHandle {
    to_slack: mpsc::Sender<RelayMessage>,
    to_discord: mpsc::Sender<RelayMessage>,
}

/// Consumer side of the two relay lanes.
pub struct LaneReceivers {
    pub to_slack: mpsc::Receiver<RelayMessage>,
    pub to_discord: mpsc::Receiver<RelayMessage>,
}

impl RelayHandle {
    /// Create both lanes with room for `capacity` messages each.
    pub fn bounded(capacity: usize) -> (Self, LaneReceivers) {
        let capacity = capacity.max(1);
        let (to_slack, to_slack_rx) = mpsc::channel(capacity);
        let (to_discord, to_discord_rx) = mpsc::channel(capacity);
        (
            Self {
                to_slack,
                to_discord,
            },
            LaneReceivers {
                to_slack: to_slack_rx,
                to_discord: to_discord_rx,
            },
        )
    }

    fn lane(&self, direction: Direction) -> &mpsc::Sender<RelayMessage> {
        match direction {
            Direction::DiscordToSlack => &self.to_slack,
            Direction::SlackToDiscord => &self.to_discord,
        }
    }

    fn check_direction(direction: Direction, msg: &RelayMessage) -> Result<(), EnqueueError> {
        if msg.origin != direction.source() {
            return Err(EnqueueError::WrongDirection {
                direction,
                origin: msg.origin,
            });
        }
        Ok(())
    }

    /// Append to the lane, waiting for capacity when it is full.
    pub async fn enqueue(&self, direction: Direction, msg: RelayMessage) -> Result<(), EnqueueError> {
        Self::check_direction(direction, &msg)?;
        self.lane(direction)
            .send(msg)
            .await
            .map_err(|_| EnqueueError::Closed)
    }

    /// Append without waiting; a full lane returns the message to the caller.
    pub fn try_enqueue(&self, direction: Direction, msg: RelayMessage) -> Result<(), EnqueueError> {
        Self::check_direction(direction, &msg)?;
        self.lane(direction).try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => EnqueueError::Full(msg),
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Enqueue on the lane matching the message's origin.
    ///
    /// Tries without waiting first; a full lane is logged and then waited on.
    pub async fn submit(&self, msg: RelayMessage) -> Result<(), EnqueueError> {
        let direction = msg.direction();
        match self.try_enqueue(direction, msg) {
            Err(EnqueueError::Full(msg)) => {
                debug!("Relay lane {} is full, waiting for room", direction);
                self.enqueue(direction, msg).await
            }
            other => other,
        }
    }
}

/// Owns both relay lanes and forwards each message to the opposite adapter.
pub struct Coordinator {
    mapper: Arc<Mapper>,
    discord: Arc<dyn PlatformAdapter>,
    slack: Arc<dyn PlatformAdapter>,
    to_slack: mpsc::Receiver<RelayMessage>,
    to_discord: mpsc::Receiver<RelayMessage>,
    stats: Arc<RelayStats>,
}

impl Coordinator {
    pub fn new(
        mapper: Arc<Mapper>,
        discord: Arc<dyn PlatformAdapter>,
        slack: Arc<dyn PlatformAdapter>,
        queue_capacity: usize,
    ) -> (Self, RelayHandle) {
        let (handle, lanes) = RelayHandle::bounded(queue_capacity);
        let coordinator = Self {
            mapper,
            discord,
            slack,
            to_slack: lanes.to_slack,
            to_discord: lanes.to_discord,
            stats: Arc::new(RelayStats::default()),
        };
        (coordinator, handle)
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Drain both lanes until `shutdown` fires or every handle is dropped.
    ///
    /// Lanes run concurrently so a slow platform only stalls its own direction.
    pub async fn run(self, shutdown: CancellationToken) {
        let Coordinator {
            mapper,
            discord,
            slack,
            to_slack,
            to_discord,
            stats,
        } = self;

        info!("Relay coordinator started");

        tokio::join!(
            run_lane(
                Direction::DiscordToSlack,
                to_slack,
                &mapper,
                slack.as_ref(),
                stats.lane(Direction::DiscordToSlack),
                &shutdown,
            ),
            run_lane(
                Direction::SlackToDiscord,
                to_discord,
                &mapper,
                discord.as_ref(),
                stats.lane(Direction::SlackToDiscord),
                &shutdown,
            ),
        );

        for direction in [Direction::DiscordToSlack, Direction::SlackToDiscord] {
            let counts = stats.lane(direction).snapshot();
            info!(
                "Relay lane {} stopped: {} relayed, {} filtered, {} failed",
                direction, counts.relayed, counts.filtered, counts.failed
            );
        }
    }
}

async fn run_lane(
    direction: Direction,
    mut queue: mpsc::Receiver<RelayMessage>,
    mapper: &Mapper,
    target: &dyn PlatformAdapter,
    stats: &LaneStats,
    shutdown: &CancellationToken,
) {
    debug!("Relay lane {} delivering to {}", direction, target.platform());

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };

        let outcome = filter(mapper, &msg);
        if outcome != FilterOutcome::Pass {
            debug!(
                "Dropping {} message from {} in {}: {:?}",
                direction, msg.sender_id, msg.channel_id, outcome
            );
            stats.filtered.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match target.send(&msg).await {
            Ok(()) => {
                debug!("Relayed {} message from {}", direction, msg.sender_id);
                stats.relayed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Failed to relay {} message: {}", direction, e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
