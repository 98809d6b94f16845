use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtm_client::config::Config;
use rtm_client::logging;
use rtm_client::peer::DetachedConnector;
use rtm_client::{Event, RtmClient};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rtm-client", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Log level, overridden by RTM_LOG
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Log file (defaults to ~/.rtm-client/logs/rtm-client.log)
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and log events until Ctrl-C
    Connect {
        /// User to connect as (defaults to `user` from the config)
        #[arg(long)]
        user: Option<String>,
    },
    /// Connect and call another user
    Call {
        target: String,
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_path = match &cli.log_file {
        Some(path) => {
            logging::init_log_file(path, &cli.log_level)?;
            path.clone()
        }
        None => logging::init_default_log_file(&cli.log_level)?,
    };

    let cfg = Config::load(&cli.config)?;
    info!(config = ?cfg, log = %log_path.display(), "rtm-client start");

    let (user, target) = match cli.command {
        Commands::Connect { user } => (user, None),
        Commands::Call { target, user } => (user, Some(target)),
    };
    let user = user
        .or_else(|| cfg.user.clone())
        .context("no user given and none in config")?;

    run(cfg, &user, target.as_deref()).await
}

async fn run(cfg: Config, user: &str, target: Option<&str>) -> Result<()> {
    let client = RtmClient::new(cfg, Arc::new(DetachedConnector))?;
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        res = session(&client, user, target) => {
            if let Err(err) = res {
                error!(error = %err, "session failed");
            }
            tokio::signal::ctrl_c().await?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    info!("shutting down");
    client.destroy().await?;
    Ok(())
}

async fn session(client: &RtmClient, user: &str, target: Option<&str>) -> rtm_client::Result<()> {
    client.connect(user).await?;
    info!(user, "connected");
    if let Some(target) = target {
        let channel = client.do_call(target).await?;
        info!(callee = target, channel = %channel, "call placed");
    }
    std::future::pending::<()>().await;
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::StateChanged(state) => info!(
            connected = state.connected,
            connecting = state.connecting,
            reconnecting = state.reconnecting,
            latency_ms = state.latency_ms,
            attempts = state.reconnect_attempts,
            "state changed"
        ),
        Event::Error(err) => warn!(code = %err.code, msg = %err.msg, "server error"),
        Event::Peer(peer) => info!(
            kind = %peer.kind,
            channel = %peer.channel,
            user = %peer.record.user,
            details = peer.details.as_deref().unwrap_or_default(),
            "peer event"
        ),
        Event::Stream(stream) => info!(
            channel = %stream.channel,
            user = %stream.record.user,
            stream = %stream.stream.id,
            "stream"
        ),
    }
}
