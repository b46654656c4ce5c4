mod cache;
mod config;
mod connectivity;
mod db;
mod net;
mod queue;
mod remote;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheManager, CACHED_AT_HEADER};
use config::Config;
use connectivity::ConnectivityMonitor;
use db::SqliteStorage;
use net::{HttpNetwork, Request};
use queue::{OfflineQueue, RecordKind};
use remote::HttpRemoteStore;
use sync::{Outbox, SyncCoordinator};
use worker::{Services, Worker, WorkerHandle, WorkerRequest, WorkerResponse};

#[derive(Parser, Debug)]
#[command(name = "fitsync")]
#[command(about = "Offline sync and response cache for the fitness tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fitsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the background worker until Ctrl-C
  Run,
  /// Write a workout or program, queueing it when the store is unreachable
  Submit {
    #[arg(long)]
    kind: RecordKind,
    /// JSON file holding the record
    file: PathBuf,
  },
  /// Inspect or edit the offline queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Drain the offline queue now, retrying exhausted records
  Sync,
  /// GET a URL through the cache
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Fetch the static assets into the cache
  Precache,
  /// Show cache and queue usage
  Quota,
  /// Drop stale entries and enforce cache budgets
  Cleanup,
  /// Delete every cached response
  ClearCache,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Count,
  Remove { local_id: String },
}

type AppServices = Services<SqliteStorage, HttpNetwork, HttpRemoteStore>;

/// Log to a daily file under the data directory, and to stderr when verbose.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  // RUST_LOG overrides the default filter (e.g. RUST_LOG=fitsync=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fitsync=info"));

  std::fs::create_dir_all(log_dir)
    .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
  let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "fitsync.log"));

  let stderr_layer = verbose.then(|| fmt::layer().with_writer(io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr_layer)
    .init();

  Ok(guard)
}

fn build_services(config: &Config) -> Result<(AppServices, Arc<HttpNetwork>)> {
  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let network = Arc::new(HttpNetwork::new().map_err(|e| eyre!("{}", e))?);
  let remote = Arc::new(HttpRemoteStore::new(&config.remote.base_url).map_err(|e| eyre!("{}", e))?);

  let cache = CacheManager::new(
    Arc::clone(&storage),
    Arc::clone(&network),
    &config.app,
    config.cache.clone(),
    config.sync.network_timeout(),
  )
  .wrap_err("Invalid app origin or shell path")?;

  let queue = OfflineQueue::new(storage, config.sync.queue_max_items);
  let services = Services {
    cache,
    queue: queue.clone(),
    coordinator: SyncCoordinator::new(queue.clone(), Arc::clone(&remote), config.sync.clone()),
    outbox: Outbox::new(queue, remote, config.sync.clone()),
  };

  Ok((services, network))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config::data_dir()?.join("logs"), args.verbose)?;

  let (services, network) = build_services(&config)?;
  let cache = services.cache.clone();
  let worker = Worker::new(services, Duration::from_secs(config.sync.interval_secs));
  let (handle, requests) = WorkerHandle::channel(config.worker.reply_timeout());

  match args.command {
    Command::Run => run_worker(&config, worker, handle, requests, network).await,
    command => {
      // One-shot commands talk to an in-process worker without a connectivity monitor
      let (_events, connectivity) = mpsc::unbounded_channel();
      tokio::spawn(worker.run(requests, connectivity, std::future::pending()));
      let result = run_command(&config, &handle, command).await;
      // Background cache refreshes would be cancelled with the runtime
      cache.flush().await;
      result
    }
  }
}

async fn run_command(config: &Config, handle: &WorkerHandle, command: Command) -> Result<()> {
  match command {
    Command::Run => Err(eyre!("`run` is not a one-shot command")),
    Command::Submit { kind, file } => {
      let contents = std::fs::read_to_string(&file)
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
      let payload: serde_json::Value = serde_json::from_str(&contents)
        .wrap_err_with(|| format!("{} is not valid JSON", file.display()))?;

      // A submit may spend the whole network timeout on the remote write
      let timeout = config.worker.reply_timeout() + config.sync.network_timeout();
      match handle
        .call_with_timeout(WorkerRequest::Submit { kind, payload }, timeout)
        .await?
      {
        WorkerResponse::Submitted(outcome) => print_json(&outcome),
        other => unexpected(other),
      }
    }
    Command::Queue { action } => match action {
      QueueAction::List => match handle.call(WorkerRequest::ListQueue).await? {
        WorkerResponse::Queue(records) => print_json(&records),
        other => unexpected(other),
      },
      QueueAction::Count => match handle.call(WorkerRequest::QueueCount).await? {
        WorkerResponse::Count(n) => {
          println!("{}", n);
          Ok(())
        }
        other => unexpected(other),
      },
      QueueAction::Remove { local_id } => {
        match handle
          .call(WorkerRequest::RemoveQueued {
            local_id: local_id.clone(),
          })
          .await?
        {
          WorkerResponse::Removed(true) => {
            println!("Removed {}", local_id);
            Ok(())
          }
          WorkerResponse::Removed(false) => {
            println!("{} was not queued", local_id);
            Ok(())
          }
          other => unexpected(other),
        }
      }
    },
    Command::Sync => {
      let pending = match handle.call(WorkerRequest::QueueCount).await? {
        WorkerResponse::Count(n) => n,
        other => return unexpected(other),
      };
      let per_record = config.sync.network_timeout() + config.sync.record_delay();
      let timeout = config.worker.reply_timeout() + per_record * (pending as u32 + 1);
      match handle.call_with_timeout(WorkerRequest::ForceSync, timeout).await? {
        WorkerResponse::Sync(outcome) => print_json(&outcome),
        other => unexpected(other),
      }
    }
    Command::Fetch { url, navigate } => {
      let url = Url::parse(&url).wrap_err_with(|| format!("Invalid URL {}", url))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let timeout = config.worker.reply_timeout() + config.sync.network_timeout();
      match handle
        .call_with_timeout(WorkerRequest::Fetch { request }, timeout)
        .await?
      {
        WorkerResponse::Fetched(result) => {
          eprintln!("{} ({:?})", result.response.status, result.source);
          if let Some(cached_at) = result.response.header(CACHED_AT_HEADER) {
            eprintln!("cached at {}", cached_at);
          }
          println!("{}", result.response.body_text());
          Ok(())
        }
        other => unexpected(other),
      }
    }
    Command::Precache => {
      let timeout = config.worker.reply_timeout() + config.sync.network_timeout();
      match handle.call_with_timeout(WorkerRequest::Precache, timeout).await? {
        WorkerResponse::Precached { cached } => {
          println!("Cached {} static assets", cached);
          Ok(())
        }
        other => unexpected(other),
      }
    }
    Command::Quota => match handle.call(WorkerRequest::CheckQuota).await? {
      WorkerResponse::Quota(report) => print_json(&report),
      other => unexpected(other),
    },
    Command::Cleanup => match handle.call(WorkerRequest::Cleanup).await? {
      WorkerResponse::CleanedUp { removed } => {
        println!("Removed {} cache entries", removed);
        Ok(())
      }
      other => unexpected(other),
    },
    Command::ClearCache => match handle.call(WorkerRequest::ClearCache).await? {
      WorkerResponse::Cleared { removed } => {
        println!("Cleared {} cache entries", removed);
        Ok(())
      }
      other => unexpected(other),
    },
  }
}

async fn run_worker(
  config: &Config,
  worker: Worker<SqliteStorage, HttpNetwork, HttpRemoteStore>,
  // Held so the request channel stays open while the worker runs
  _handle: WorkerHandle,
  requests: mpsc::Receiver<worker::Envelope>,
  network: Arc<HttpNetwork>,
) -> Result<()> {
  let health_url = config
    .remote
    .health_url()
    .wrap_err("Invalid remote health URL")?;

  worker.install().await;
  let connectivity = ConnectivityMonitor::spawn(
    network,
    health_url,
    Duration::from_secs(config.remote.probe_interval_secs),
    config.sync.network_timeout(),
  );

  info!("fitsync worker running, press Ctrl-C to stop");
  let shutdown = async {
    let _ = tokio::signal::ctrl_c().await;
  };
  worker
    .run(requests, connectivity.into_receiver(), shutdown)
    .await;
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn unexpected(response: WorkerResponse) -> Result<()> {
  Err(eyre!("Unexpected worker response: {:?}", response))
}
