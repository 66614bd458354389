//! Crawl Agent CLI Entry Point
//!
//! This is the main entry point for the Crawl Agent binary. The page host
//! launches it and speaks line-delimited JSON over stdin/stdout, so all
//! logging goes to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crawl_agent::agent::events::EVENT_CAPACITY;
use crawl_agent::cli::config::{Config, LoggingConfig};
use crawl_agent::connection::outbox::OUTBOUND_CAPACITY;
use crawl_agent::storage::{KEY_AUTH_TOKEN, KEY_CLIENT_ID, KEY_USERNAME};
use crawl_agent::{
    Agent, AgentStateManager, FileStore, IdentityHandle, IdentityManager, KeyValueStore, Outbox, StdioHost,
    SystemSignals, WebSocketClientBuilder,
};

#[derive(Parser)]
#[command(name = "crawl-agent")]
#[command(author, version, about = "Crawl Agent - runs server-assigned crawl scripts in the user's browser")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,
    /// Show stored identity and session state
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Start => {
            start_agent(&config).await?;
        }
        Commands::Status => {
            show_status(&config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

fn open_store(config: &Config) -> Result<FileStore> {
    let store = match &config.agent.data_dir {
        Some(dir) => FileStore::open(dir),
        None => FileStore::open_default(),
    };
    store.context("Failed to open local storage")
}

async fn start_agent(config: &Config) -> Result<()> {
    info!("Starting Crawl Agent...");

    let store: Arc<dyn KeyValueStore> = Arc::new(open_store(config)?);

    // Identity first: every outbound message carries it
    let signals = SystemSignals::new(&config.environment.screen, &config.environment.gpu);
    let identity = IdentityManager::new(store.clone(), Box::new(signals)).get_or_create();
    info!(client_id = %identity.id, source = ?identity.derived_from, "Client identity ready");
    let identity_handle = IdentityHandle::with_id(&identity.id);

    let token = store
        .get(KEY_AUTH_TOKEN)
        .context("Failed to read stored credentials")?
        .filter(|t| !t.trim().is_empty());
    let Some(token) = token else {
        bail!("Not logged in. Run `crawlctl login` first.");
    };
    let username = store.get(KEY_USERNAME).ok().flatten().unwrap_or_default();

    let state_manager = AgentStateManager::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
    let (outbox, outbound_rx) = Outbox::channel(identity_handle.clone(), OUTBOUND_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::channel(16);

    info!(url = %config.server.url, "Connecting to dispatch server");
    let ws_client = WebSocketClientBuilder::new(&config.server.url, state_manager.clone(), identity_handle.clone())
        .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
        .heartbeat_interval(Duration::from_secs(config.server.heartbeat_interval_secs))
        .reconnect_policy(config.server.reconnect_policy())
        .build(events_tx.clone(), outbound_rx, commands_rx);

    let host = StdioHost::spawn(events_tx.clone());

    let agent = Agent::new(
        config.agent.settings(),
        state_manager,
        identity_handle,
        outbox,
        commands_tx,
        host,
        (events_tx, events_rx),
    );
    let handle = agent.handle();

    let ws_task = tokio::spawn(ws_client.run());
    let mut agent_task = tokio::spawn(agent.run());

    handle.login(token, username).await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            handle.shutdown().await;
            let _ = (&mut agent_task).await;
        }
        _ = &mut agent_task => {}
    }

    if let Err(e) = ws_task.await {
        warn!(error = %e, "Connection task ended abnormally");
    }

    info!("Crawl Agent stopped");
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let store = open_store(config)?;

    println!("Agent Status:");
    println!("  Data directory: {}", store.base_dir().display());
    println!("  Server: {}", config.server.url);

    match store.get(KEY_CLIENT_ID)? {
        Some(id) => println!("  Client ID: {}", id),
        None => println!("  Client ID: not created yet"),
    }

    match (store.get(KEY_AUTH_TOKEN)?, store.get(KEY_USERNAME)?) {
        (Some(_), Some(username)) => println!("  Session: logged in as {}", username),
        (Some(_), None) => println!("  Session: logged in"),
        _ => println!("  Session: logged out (run `crawlctl login`)"),
    }

    Ok(())
}

fn show_version() {
    println!("crawl-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Browser-resident crawl task agent");
    println!();
    println!("Features:");
    println!("  - Persistent WebSocket session with the dispatch server");
    println!("  - Script cache with domain matching");
    println!("  - Idle-aware task scheduling");
    println!("  - Auto-reconnection with exponential backoff");
}
