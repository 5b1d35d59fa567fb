//! faultline - CLI for the buffered error telemetry client
//!
//! This tool provides commands for:
//! - Showing the resolved telemetry configuration
//! - Sending events from a JSON Lines file through the persistent queue
//! - Retrying events left in the queue by earlier runs
//! - Inspecting and clearing the queue
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/faultline/queue.db (~/.local/share/faultline/queue.db)
//! - Config: $XDG_CONFIG_HOME/faultline/config.toml (~/.config/faultline/config.toml)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faultline_core::capture::{install_panic_hook, CaptureLayer};
use faultline_core::queue::{EventQueue, FlushOutcome};
use faultline_core::storage::{SqliteStorage, StorageAdapter};
use faultline_core::transport::HttpSender;
use faultline_core::{default_config, Client, Config, Event, Level, ResolvedConfig, TagValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faultline")]
#[command(about = "Buffered error telemetry client")]
#[command(version)]
struct Args {
    /// Verbose output (writes logs to the state directory)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved telemetry configuration as JSON
    Config {
        /// Print built-in defaults instead of the config file
        #[arg(long)]
        defaults: bool,
    },

    /// Queue events from a JSON Lines file (or `-` for stdin) and deliver them
    Send {
        /// Input file, one event object per line
        file: PathBuf,
    },

    /// Deliver events left in the queue by earlier runs
    Flush,

    /// Show configuration and queue status
    Status,

    /// Drop every queued event
    Clear,
}

/// One input line for `send`
#[derive(Debug, Deserialize)]
struct EventLine {
    message: String,
    #[serde(default)]
    level: Level,
    #[serde(default)]
    tags: BTreeMap<String, TagValue>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl EventLine {
    fn into_event(self) -> Event {
        let mut event = Event::new(self.level, self.message);
        event.tags = self.tags;
        event.extra = self.extra;
        event
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    match args.command {
        Command::Config { defaults } => cmd_config(&config, defaults),
        Command::Send { file } => cmd_send(&config, &file, args.verbose).await,
        Command::Flush => cmd_flush(&config, args.verbose).await,
        Command::Status => cmd_status(&config),
        Command::Clear => cmd_clear(),
    }
}

fn cmd_config(config: &Config, defaults: bool) -> Result<()> {
    let rendered = if defaults {
        default_config().to_json()
    } else {
        let resolved = config.resolve().context("invalid telemetry configuration")?;
        let mut value = resolved.settings.to_json();
        value["api_url"] = serde_json::Value::String(resolved.api_url.clone());
        value["api_key"] = serde_json::Value::String(mask(&resolved.api_key));
        value
    };

    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn cmd_send(config: &Config, file: &Path, verbose: bool) -> Result<()> {
    let events = read_events(file)?;
    let resolved = config.resolve().context("invalid telemetry configuration")?;
    let client = Arc::new(build_client(config, resolved)?);

    let _log_guard = if verbose {
        install_panic_hook(client.clone());
        Some(
            faultline_core::logging::init(&config.logging, Some(CaptureLayer::new(client.clone())))
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    let mut captured = 0;
    for event in events {
        if client.capture_event(event).is_some() {
            captured += 1;
        }
    }
    tracing::info!(captured, input = %file.display(), "Queued events from input");
    println!("Queued {} event(s)", captured);

    drain(client.queue()).await;
    Ok(())
}

async fn cmd_flush(config: &Config, verbose: bool) -> Result<()> {
    let resolved = config.resolve().context("invalid telemetry configuration")?;
    let client = build_client(config, resolved)?;

    let _log_guard = if verbose {
        Some(
            faultline_core::logging::init(&config.logging, None)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    let pending = client.queue().size();
    if pending == 0 {
        println!("No queued events to flush.");
        return Ok(());
    }

    println!("Flushing {} queued event(s)...", pending);
    drain(client.queue()).await;
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Faultline Configuration");
    println!("=======================");
    println!();
    println!("Config File:     {}", Config::config_path().display());

    match config.resolve() {
        Ok(resolved) => {
            let settings = &resolved.settings;
            println!("API URL:         {}", resolved.api_url);
            println!("API Key:         {}", mask(&resolved.api_key));
            println!("Environment:     {}", settings.environment);
            println!("Enabled:         {}", settings.enabled);
            println!("Sample Rate:     {}", settings.sample_rate);
            println!("Batch Size:      {}", settings.max_batch_size);
            println!("Queue Size:      {}", settings.max_queue_size);
            println!("Flush Interval:  {}ms", settings.flush_interval_ms);
            println!("Timeout:         {}s", config.delivery.timeout_secs);
            println!();
            println!("Status: Ready to send");
        }
        Err(e) => {
            println!();
            println!("Status: Not configured ({})", e);
            println!();
            println!("Add a [telemetry] table to config.toml:");
            println!();
            println!("  [telemetry]");
            println!("  api_key = \"flt_live_xxxxxxxxxxxx\"");
            println!("  api_url = \"https://collector.example.com/v1/events\"");
        }
    }

    println!();
    let db_path = Config::queue_db_path();
    println!("Queue Database:  {}", db_path.display());
    if db_path.exists() {
        let storage = SqliteStorage::open(&db_path).context("failed to open queue database")?;
        println!("Queued Events:   {}", storage.count()?);
    } else {
        println!("Queued Events:   0");
    }

    Ok(())
}

fn cmd_clear() -> Result<()> {
    let db_path = Config::queue_db_path();
    if !db_path.exists() {
        println!("Queue database not found at {}", db_path.display());
        return Ok(());
    }

    let storage = SqliteStorage::open(&db_path).context("failed to open queue database")?;
    let count = storage.count()?;
    storage.clear().context("failed to clear queue")?;
    println!("Cleared {} queued event(s)", count);
    Ok(())
}

/// Client backed by the on-disk queue and an HTTP sender
fn build_client(config: &Config, resolved: ResolvedConfig) -> Result<Client> {
    let storage =
        SqliteStorage::open(&Config::queue_db_path()).context("failed to open queue database")?;
    let sender = HttpSender::new(&resolved, config.delivery.timeout())
        .context("failed to create HTTP sender")?;

    let queue = EventQueue::builder(config.queue_options(&resolved.settings), Arc::new(sender))
        .storage(Arc::new(storage))
        .build();

    Ok(Client::with_queue(resolved, queue))
}

/// Flush until the queue is empty or a send fails
async fn drain(queue: &EventQueue) {
    let summary = queue.drain().await;
    if let FlushOutcome::Failed(reason) = &summary.last {
        tracing::warn!(%reason, "Stopping drain after failed send");
        eprintln!("Delivery failed: {}", reason);
    }

    println!("Delivered {} event(s)", summary.delivered);
    let remaining = queue.size();
    if remaining > 0 {
        println!("{} event(s) remain queued. Run 'flush' to retry.", remaining);
    }
}

fn read_events(file: &Path) -> Result<Vec<Event>> {
    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let handle = std::fs::File::open(file)
            .with_context(|| format!("failed to open {}", file.display()))?;
        Box::new(BufReader::new(handle))
    };

    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: EventLine = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        events.push(parsed.into_event());
    }
    Ok(events)
}

/// Show only the first few characters of a secret
fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}
