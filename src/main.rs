use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use boardsync_core::UserId;
use boardsync_server::{ServerConfig, StaticSessions};
use boardsync_store::{Database, SqlitePresenceStore};
use boardsync_telemetry::{init_telemetry, TelemetryConfig};

const PRESENCE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "boardsync", about = "Real-time sync server for collaborative boards")]
struct Cli {
    #[arg(long, default_value_t = 9292)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, default_value_t = 10)]
    max_connections_per_user: usize,

    /// SQLite file for presence rows. In-memory if omitted.
    #[arg(long)]
    database: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty_logs: bool,

    /// Static session, `TOKEN=USER` or `TOKEN=USER:admin`. Repeatable.
    #[arg(long = "session", value_parser = parse_session)]
    sessions: Vec<(String, String, bool)>,
}

fn parse_session(s: &str) -> Result<(String, String, bool), String> {
    let (token, user) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=USER[:admin], got {s:?}"))?;
    let (user, is_admin) = match user.strip_suffix(":admin") {
        Some(user) => (user, true),
        None => (user, false),
    };
    if token.is_empty() || user.is_empty() {
        return Err(format!("expected TOKEN=USER[:admin], got {s:?}"));
    }
    Ok((token.to_string(), user.to_string(), is_admin))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level,
        json: !cli.pretty_logs,
        ..Default::default()
    });

    tracing::info!("starting boardsync");

    let db = match &cli.database {
        Some(path) => {
            let db = Database::open(path).with_context(|| format!("opening {}", path.display()))?;
            tracing::info!(path = %path.display(), "database opened");
            db
        }
        None => Database::in_memory().context("opening in-memory database")?,
    };

    let config = ServerConfig {
        port: cli.port,
        bind: cli.bind,
        max_connections_per_user: cli.max_connections_per_user,
        ..Default::default()
    };

    let presence = SqlitePresenceStore::new(db, config.presence_timeout);
    let cleanup_token = CancellationToken::new();
    let cleanup = presence.spawn_cleanup(
        PRESENCE_CLEANUP_INTERVAL,
        config.presence_timeout,
        cleanup_token.clone(),
    );

    let sessions = Arc::new(StaticSessions::new());
    for (token, user, is_admin) in cli.sessions {
        sessions.insert(token, UserId::from_raw(user), is_admin);
    }
    if sessions.is_empty() {
        tracing::warn!("no sessions configured; every stream will be anonymous");
    }

    let handle = boardsync_server::start(config, Arc::new(presence), sessions)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port(), "boardsync ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    cleanup_token.cancel();
    let _ = cleanup.await;
    Ok(())
}
