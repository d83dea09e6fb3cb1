//! boxsync Daemon - Background synchronization service
//!
//! Runs one live sync engine for the configured syncbox:
//! - Loads and validates the YAML configuration
//! - Opens the local index, rebuilding it when it is corrupted
//! - Wires the REST, push channel and filesystem adapters
//! - Logs engine events until SIGTERM/SIGINT, then stops every engine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use boxsync_cache::{IndexPool, SqliteLocalIndex};
use boxsync_core::config::{AuthConfig, Config, LoggingConfig};
use boxsync_core::domain::{Credentials, EngineEvent, ItemOutcome, SyncMode};
use boxsync_core::ports::ICredentialRefresher;
use boxsync_rest::{LongPollPushChannel, RestClient};
use boxsync_sync::engine::EnginePorts;
use boxsync_sync::filesystem::LocalFileSystemAdapter;
use boxsync_sync::registry::EngineRegistry;
use boxsync_sync::{EngineOptions, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "boxsyncd", version, about = "boxsync background synchronization daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wipe the local index before starting; the first pass re-lists the
    /// whole syncbox
    #[arg(long)]
    reset: bool,

    /// Emit JSON log lines (overrides `logging.json`)
    #[arg(long)]
    json: bool,
}

// ============================================================================
// Configuration and logging
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration:\n  {}", details.join("\n  "));
    }
    Ok(config)
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", logging.level)));

    if json || logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Read credentials from the credentials file, the config or the
/// environment, in that order
fn load_credentials(auth: &AuthConfig) -> Result<Credentials> {
    if let Some(path) = &auth.credentials_file {
        return read_credentials_file(path);
    }

    let key = auth
        .key
        .clone()
        .or_else(|| std::env::var("BOXSYNC_KEY").ok())
        .context("No API key: set auth.key, auth.credentials_file or BOXSYNC_KEY")?;
    let secret = auth
        .secret
        .clone()
        .or_else(|| std::env::var("BOXSYNC_SECRET").ok())
        .context("No API secret: set auth.secret, auth.credentials_file or BOXSYNC_SECRET")?;
    Ok(Credentials::new(key, secret))
}

fn read_credentials_file(path: &Path) -> Result<Credentials> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials from {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Malformed credentials file {}", path.display()))
}

/// Re-reads the credentials file when the server rejects the current
/// credentials
///
/// An external tool renews the file; without a file there is nothing to
/// refresh from.
struct FileCredentialRefresher {
    path: Option<PathBuf>,
}

#[async_trait]
impl ICredentialRefresher for FileCredentialRefresher {
    async fn refresh(&self, current: &Credentials) -> Result<Option<Credentials>> {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        let fresh = tokio::task::spawn_blocking(move || read_credentials_file(&path))
            .await
            .context("Credential reader panicked")??;

        if &fresh == current {
            debug!("Credentials file unchanged");
            Ok(None)
        } else {
            info!("Loaded renewed credentials");
            Ok(Some(fresh))
        }
    }
}

// ============================================================================
// Index
// ============================================================================

async fn open_index(path: &Path) -> Result<IndexPool> {
    match IndexPool::open(path).await {
        Ok(pool) => Ok(pool),
        Err(e) if e.requires_rebuild() => {
            warn!(path = %path.display(), error = %e, "Rebuilding unusable index");
            IndexPool::recover(path)
                .await
                .context("Failed to rebuild the local index")
        }
        Err(e) => Err(e).context("Failed to open the local index"),
    }
}

// ============================================================================
// Events and shutdown
// ============================================================================

/// Log engine events until the channel closes or `shutdown` fires
async fn log_events(mut events: broadcast::Receiver<EngineEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(EngineEvent::ItemCompleted {
                event_id,
                path,
                outcome: ItemOutcome::Failed(reason),
            }) => warn!(%event_id, ?path, reason = %reason, "Change failed"),
            Ok(EngineEvent::ItemCompleted {
                event_id,
                path,
                outcome,
            }) => debug!(%event_id, ?path, ?outcome, "Change completed"),
            Ok(EngineEvent::PushNotificationError { push, poll }) => {
                warn!(?push, ?poll, "Server notifications unavailable")
            }
            Ok(EngineEvent::QuotaExceeded {
                usage_bytes,
                limit_bytes,
            }) => warn!(usage_bytes, limit_bytes, "Quota exceeded"),
            Ok(other) => info!(event = ?other, "Engine event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

async fn run(cli: Cli, config: Config, shutdown: CancellationToken) -> Result<()> {
    let credentials = load_credentials(&config.auth)?;
    let options = EngineOptions::from_config(&config)?;

    let pool = open_index(&config.index.path).await?;
    let index = Arc::new(SqliteLocalIndex::new(pool.pool().clone()));

    let client = RestClient::new(&config.server.base_url, config.server.request_timeout())
        .context("Failed to create REST client")?;
    let ports = EnginePorts {
        index,
        fs: Arc::new(LocalFileSystemAdapter::new(options.root.clone())),
        rest: Arc::new(client.clone()),
        push: Arc::new(LongPollPushChannel::new(client)),
        refresher: Arc::new(FileCredentialRefresher {
            path: config.auth.credentials_file.clone(),
        }),
    };

    let engine = SyncEngine::new(ports, credentials, options);
    if cli.reset {
        engine.reset_local_cache().await?;
        info!("Local index reset");
    }

    let logger = tokio::spawn(log_events(engine.subscribe(), shutdown.clone()));
    engine.start(SyncMode::LiveSync).await?;
    info!(
        root = %config.sync.root.display(),
        syncbox = config.server.syncbox_id,
        "Live sync running"
    );

    shutdown.cancelled().await;

    EngineRegistry::global().shutdown_all().await;
    if let Err(e) = logger.await {
        debug!(error = %e, "Event logger ended abnormally");
    }
    pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.json);

    info!("boxsync daemon starting (boxsyncd)");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = run(cli, config, shutdown).await;
    match &result {
        Ok(()) => info!("boxsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "boxsync daemon exiting with error"),
    }
    result
}
