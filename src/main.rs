mod config;
mod mapper;
mod platform;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::mapper::Mapper;
use crate::platform::discord::{self, http::DiscordHttp, DiscordAdapter};
use crate::platform::slack::{self, web::SlackWeb, SlackAdapter};
use crate::platform::PlatformAdapter;
use crate::relay::{Coordinator, Direction};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let credentials = config.credentials()?;
    let mapper = Arc::new(Mapper::from_config(&config)?);

    info!("Configuration loaded successfully");
    info!("  Channel pairs: {}", config.channels.len());
    info!("  User mappings: {}", config.users.len());
    info!("  Queue capacity: {}", config.relay.queue_capacity);

    let discord_adapter = Arc::new(DiscordAdapter::new(
        Arc::new(DiscordHttp::new(credentials.discord_token.clone())),
        Arc::clone(&mapper),
        config.relay.embed_color,
    )?);

    let slack_web = Arc::new(SlackWeb::new(credentials.slack_bot_token.clone()));
    let identity = slack_web
        .auth_test()
        .await
        .context("Slack rejected the bot token")?;
    info!("Slack bot identity: {} ({})", identity.user_id, identity.url);
    let slack_adapter = Arc::new(SlackAdapter::new(slack_web.clone(), Arc::clone(&mapper))?);
    slack_adapter.set_identity(identity);

    let discord_target: Arc<dyn PlatformAdapter> = discord_adapter.clone();
    let slack_target: Arc<dyn PlatformAdapter> = slack_adapter.clone();
    let (coordinator, handle) = Coordinator::new(
        mapper,
        discord_target,
        slack_target,
        config.relay.queue_capacity,
    );
    let stats = coordinator.stats();

    let shutdown = CancellationToken::new();
    let reconnect_delay = Duration::from_secs(config.relay.reconnect_delay_secs);

    let discord_listener = tokio::spawn(discord::gateway::run(
        discord_adapter,
        credentials.discord_token,
        handle.clone(),
        reconnect_delay,
        shutdown.clone(),
    ));
    let slack_listener = tokio::spawn(slack::socket::run(
        slack_adapter,
        slack_web,
        credentials.slack_app_token,
        handle,
        reconnect_delay,
        shutdown.clone(),
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    info!("Relay is starting...");
    coordinator.run(shutdown.clone()).await;

    // The coordinator also stops if every producer is gone
    shutdown.cancel();
    for listener in [discord_listener, slack_listener] {
        if let Err(e) = listener.await {
            warn!("Listener task failed: {}", e);
        }
    }

    let relayed: u64 = [Direction::DiscordToSlack, Direction::SlackToDiscord]
        .into_iter()
        .map(|direction| stats.lane(direction).snapshot().relayed)
        .sum();
    info!("Relay stopped after {} relayed message(s)", relayed);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
