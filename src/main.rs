use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use pacer::app::App;
use pacer::config::Config;
use pacer::event::UiEvent;
use pacer::interceptor::Intercepted;
use pacer::replay::DrainTrigger;

#[derive(Parser, Debug)]
#[command(name = "pacer")]
#[command(about = "Offline-first HTTP client that queues writes until the network returns")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pacer/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the API base URL
  #[arg(long)]
  base_url: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request through the interceptor
  Send {
    method: String,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as NAME:VALUE, may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
  },
  /// Show connectivity and queue size
  Status,
  /// Replay queued mutations now
  Flush,
  /// List mutations that ran out of retries
  Failed,
  /// Move a failed mutation back into the queue
  Retry { id: i64 },
  /// Drop a failed mutation
  Discard { id: i64 },
  /// Follow connectivity and replay queued mutations as the network comes and goes
  Watch,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| format!("expected NAME:VALUE, got {raw:?}"))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("pacer")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "pacer.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("PACER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;
  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = if let Some(base_url) = args.base_url {
    let mut config = config;
    config.api.base_url = base_url;
    config
  } else {
    config
  };

  let app = App::open(config)?;
  let result = run(&app, args.command).await;
  app.close()?;
  result
}

async fn run(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let online = app.probe()?.probe_once().await;
      println!("online:  {}", online);
      println!("queued:  {}", app.queue().count()?);
      println!("failed:  {}", app.queue().failed_count()?);
    }
    Command::Failed => {
      for failed in app.queue().list_failed()? {
        let at = Utc
          .timestamp_millis_opt(failed.failed_at)
          .single()
          .map(|t| t.to_rfc3339())
          .unwrap_or_default();
        println!(
          "{:>5}  {:<6} {}  attempts={} failed_at={} error={}",
          failed.mutation.id,
          failed.mutation.method,
          failed.mutation.url,
          failed.attempts,
          at,
          failed.last_error.as_deref().unwrap_or("-")
        );
      }
    }
    Command::Send {
      method,
      path,
      body,
      headers,
    } => {
      app.probe()?.probe_once().await;
      let request = app.request(&method, &path, body, &headers)?;
      let (handle, join) = app.spawn_worker()?;
      let outcome = handle.handle(request).await;
      handle.shutdown(join).await;

      match outcome {
        Intercepted::Applied(response) => {
          println!("{}", response.status);
          println!("{}", response.text());
        }
        Intercepted::Stale {
          response,
          cached_at,
        } => {
          println!("{} (offline, cached {})", response.status, cached_at.to_rfc3339());
          println!("{}", response.text());
        }
        Intercepted::Queued { id, response } => {
          println!("{} queued as #{}", response.status, id);
        }
        Intercepted::Failed { reason, response } => {
          if let Some(response) = response {
            println!("{}", response.status);
            println!("{}", response.text());
          }
          return Err(eyre!("Request failed: {}", reason));
        }
      }
    }
    Command::Flush => {
      app.probe()?.probe_once().await;
      let (handle, join) = app.spawn_worker()?;
      let report = handle.flush(DrainTrigger::Requested).await;
      handle.shutdown(join).await;
      let report = report?;
      if report.offline {
        println!("offline, {} mutation(s) still queued", app.queue().count()?);
      } else {
        println!("flushed {}, {} remaining", report.flushed, report.remaining);
        for id in report.gave_up {
          println!("#{} moved to failed", id);
        }
      }
    }
    Command::Retry { id } => {
      let (handle, join) = app.spawn_worker()?;
      let retried = handle.retry_failed(id).await;
      handle.shutdown(join).await;
      if !retried? {
        return Err(eyre!("No failed mutation #{}", id));
      }
      println!("#{} queued for replay", id);
    }
    Command::Discard { id } => {
      let (handle, join) = app.spawn_worker()?;
      let discarded = handle.discard(id).await;
      handle.shutdown(join).await;
      if !discarded? {
        return Err(eyre!("No failed mutation #{}", id));
      }
      println!("#{} discarded", id);
    }
    Command::Watch => watch(app).await?,
  }
  Ok(())
}

async fn watch(app: &App) -> Result<()> {
  let probe = app.probe()?;
  probe.probe_once().await;
  let (handle, join) = app.spawn_worker()?;
  let (monitor, mut view) = app.monitor(handle.clone());

  let probe_task = tokio::spawn(probe.run());
  let monitor_task = tokio::spawn(monitor.run());
  info!("watching for connectivity changes");

  loop {
    tokio::select! {
      changed = view.state.changed() => {
        if changed.is_err() {
          break;
        }
        let state = *view.state.borrow_and_update();
        let label = if state.is_online { "online" } else { "offline" };
        println!("{}, {} queued", label, state.queue_count);
      }
      event = view.events.recv() => match event {
        Some(UiEvent::Flushed(count)) => println!("synced {} offline change(s)", count),
        Some(UiEvent::MutationFailed { id, method, url }) => {
          println!("#{} {} {} could not be delivered", id, method, url)
        }
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  probe_task.abort();
  monitor_task.abort();
  let _ = monitor_task.await;
  handle.shutdown(join).await;
  Ok(())
}
