mod cache;
mod config;
mod db;
mod event;
mod logging;
mod net;
mod probe;
mod server;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use cache::{CacheStorage, CacheStore, MemoryStorage, SqliteStorage};
use config::{Config, StorageBackend};
use event::WorkerEvent;
use worker::push::TracingNotifier;
use worker::queue::{ActionQueue, MemoryQueue, SqliteQueue};
use worker::{Registration, WorkerContext};

#[derive(Parser, Debug)]
#[command(name = "pwa-gate")]
#[command(about = "Offline-first caching gateway for a web application")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pwa-gate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Upstream origin to forward requests to
  #[arg(short, long)]
  upstream: Option<Url>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Worker version to install at startup
  #[arg(long)]
  version_tag: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(upstream) = args.upstream {
    config.upstream = upstream;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(version) = args.version_tag {
    config.worker.version = version;
  }

  // Held until exit so buffered log lines reach the file
  let _log_guard = logging::init(&config.logging)?;

  let (storage, queue): (Arc<dyn CacheStorage>, Arc<dyn ActionQueue>) =
    match config.storage.backend {
      StorageBackend::Sqlite => {
        let path = config.database_path()?;
        info!(path = %path.display(), "opening cache database");
        let db = db::Database::open(&path)?;
        (
          Arc::new(SqliteStorage::new(db.clone())),
          Arc::new(SqliteQueue::new(db)),
        )
      }
      StorageBackend::Memory => (Arc::new(MemoryStorage::new()), Arc::new(MemoryQueue::new())),
    };

  let scope = config.scope()?;
  let ctx = Arc::new(WorkerContext {
    store: CacheStore::new(storage),
    network: Arc::new(net::HttpNetwork::new(&config)?),
    queue,
    notifier: Arc::new(TracingNotifier),
    config: config.worker.clone(),
    queue_config: config.queue.clone(),
    scope: scope.clone(),
    replay_lock: tokio::sync::Mutex::new(()),
  });
  let registration = Arc::new(Registration::new(ctx));

  registration
    .dispatch(WorkerEvent::Install {
      version: config.worker.version.clone(),
    })
    .await?;

  if config.queue.enabled && config.queue.probe_interval_secs > 0 {
    probe::spawn(
      Arc::clone(&registration),
      Duration::from_secs(config.queue.probe_interval_secs),
    );
  }

  let state = server::AppState::new(registration, scope, config.max_body_bytes);
  server::serve(&config, state).await
}
