use careline::cache::{CacheStorage, CacheTier, SqliteStorage};
use careline::config::Config;
use careline::db::Database;
use careline::lifecycle::{AssetManifest, Lifecycle};
use careline::net::{HttpTransport, Request};
use careline::sync::{QueueStorage, SqliteQueueStore, SyncQueue, TaskStatus};
use careline::{Agent, AgentHandle, ForegroundEvent};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "careline")]
#[command(about = "Offline resilience and sync agent for the family-care client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/careline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve a request through the agent
  Fetch {
    /// Absolute URL or path relative to the backend
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    #[arg(long)]
    accept: Option<String>,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Send an emergency trigger, queueing it when offline
  Emergency {
    #[arg(long, default_value = "{}")]
    payload: String,
  },
  /// Deliver queued sync tasks
  Drain,
  /// List sync tasks
  Queue {
    /// pending, in_flight or failed
    #[arg(long)]
    status: Option<TaskStatus>,
  },
  /// Give a failed task a fresh set of attempts
  Retry { id: Uuid },
  /// Remove a failed task
  Dismiss { id: Uuid },
  /// Install a version from an asset manifest
  Install {
    /// Manifest JSON file (default: install.manifest from config)
    manifest: Option<PathBuf>,
    /// Activate the version once installed
    #[arg(long)]
    apply: bool,
  },
  /// Dispatch a raw push payload
  Push { payload: String },
  /// Show active version, queue and cache state
  Status,
}

/// Log to a daily file in the data directory; stdout carries command output.
fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "careline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("careline=info"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;
  info!(command = ?args.command, "careline starting");

  match args.command {
    Command::Queue { status } => {
      let store = open_store(&config)?;
      for task in store.list(status)? {
        println!(
          "{}  {:<17} {:<9} attempts={}/{}  enqueued={}{}",
          task.id,
          task.kind.as_str(),
          task.status.as_str(),
          task.attempts,
          task.max_attempts,
          task.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          task
            .last_error
            .as_deref()
            .map(|e| format!("  error={}", e))
            .unwrap_or_default()
        );
      }
      Ok(())
    }
    Command::Retry { id } => {
      open_queue(&config)?.retry(id)?;
      println!("Task {} queued for retry", id);
      Ok(())
    }
    Command::Dismiss { id } => {
      open_queue(&config)?.dismiss(id)?;
      println!("Task {} dismissed", id);
      Ok(())
    }
    Command::Status => status(&config),
    command => {
      let (agent, mut events) = Agent::init(config.clone())?;
      let result = run_command(&agent, &config, command).await;
      agent.shutdown().await?;
      print_events(&mut events);
      result
    }
  }
}

async fn run_command(agent: &AgentHandle, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Fetch {
      url,
      method,
      accept,
      data,
    } => {
      let mut request = Request::new(&method, url);
      if let Some(accept) = accept {
        request = request.with_header("accept", &accept);
      }
      if let Some(data) = data {
        request = request
          .with_header("content-type", "application/json")
          .with_body(data.into_bytes());
      }

      let response = agent.fetch(request).await?;
      println!("HTTP {}", response.status);
      println!("{}", serde_json::to_string(&response.staleness)?);
      println!();
      println!("{}", response.body_text());
    }
    Command::Emergency { payload } => {
      let payload = serde_json::from_str(&payload).map_err(|e| eyre!("Invalid payload JSON: {}", e))?;
      println!("{:?}", agent.trigger_emergency(payload).await?);
    }
    Command::Drain => {
      let report = agent.drain().await?;
      println!(
        "delivered={} retried={} failed={}{}",
        report.delivered.len(),
        report.retried.len(),
        report.failed.len(),
        if report.skipped { " (another drain was running)" } else { "" }
      );
    }
    Command::Install { manifest, apply } => {
      let path = manifest
        .or_else(|| config.install.manifest.clone())
        .ok_or_else(|| eyre!("No manifest given and install.manifest is not configured"))?;
      let manifest = AssetManifest::load(&path)?;

      let state = agent.install(manifest).await?;
      println!("Version state: {:?}", state);
      if apply {
        println!("Activated {}", agent.apply_update().await?);
      }
    }
    Command::Push { payload } => {
      let notification = agent.push(payload.into_bytes()).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Queue { .. } | Command::Retry { .. } | Command::Dismiss { .. } | Command::Status => {}
  }

  Ok(())
}

fn print_events(events: &mut mpsc::UnboundedReceiver<ForegroundEvent>) {
  while let Ok(event) = events.try_recv() {
    println!("event: {:?}", event);
  }
}

/// Read-only view of the queue. Unlike `SyncQueue::new` it leaves in-flight
/// tasks alone, so a running agent's deliveries are not disturbed.
fn open_store(config: &Config) -> Result<SqliteQueueStore> {
  Ok(SqliteQueueStore::new(Database::open(&config.database_path()?)?))
}

fn open_queue(config: &Config) -> Result<SyncQueue> {
  let db = Database::open(&config.database_path()?)?;
  SyncQueue::new(
    Arc::new(SqliteQueueStore::new(db)),
    Arc::new(HttpTransport::new()?),
    backend_url(config)?,
    config.sync.clone(),
    config.timeouts.sync(),
  )
}

fn backend_url(config: &Config) -> Result<Url> {
  Url::parse(&config.backend.base_url)
    .map_err(|e| eyre!("Invalid backend URL '{}': {}", config.backend.base_url, e))
}

fn status(config: &Config) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let transport = Arc::new(HttpTransport::new()?);
  let storage = Arc::new(SqliteStorage::new(db.clone()));
  let lifecycle = Lifecycle::new(
    db.clone(),
    storage.clone(),
    transport,
    backend_url(config)?,
    config.timeouts.static_asset(),
  )?;
  let store = SqliteQueueStore::new(db);

  println!("Backend:        {}", config.backend.base_url);
  println!("Database:       {}", config.database_path()?.display());
  println!(
    "Active version: {}",
    lifecycle.active_version().as_deref().unwrap_or("(none)")
  );
  println!("Pending tasks:  {}", store.active_count()?);
  println!("Failed tasks:   {}", store.list(Some(TaskStatus::Failed))?.len());
  for tier in CacheTier::ALL {
    println!("Cache {:<9} {}", format!("{}:", tier), storage.count(tier)?);
  }

  Ok(())
}
