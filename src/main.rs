use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offsync::{Config, Method, Request, SyncEngine};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first request cache and mutation queue for a REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offsync.yaml, then $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Issue one request through the router
  Fetch {
    /// HTTP method
    method: Method,
    url: Url,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header as `name:value`, repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    /// Treat the request as a document navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List pending mutations
  Queue,
  /// List mutations dropped after too many failed replays
  DeadLetters {
    /// Delete all dead letters
    #[arg(long, conflicts_with = "revive")]
    purge: bool,
    /// Put a dead letter back on the queue
    #[arg(long, value_name = "ID")]
    revive: Option<String>,
  },
  /// Drain the mutation queue once
  Sync,
  /// Precache the app shell and static assets for the configured version
  Install,
  /// Run the background coordinator until interrupted
  Watch,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| format!("expected name:value, got '{}'", raw))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

fn init_logging(log_dir: &Path, verbose: bool) -> WorkerGuard {
  let file = tracing_appender::rolling::daily(log_dir, "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(file);

  let filter = EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let db_path = config.db_path()?;
  let log_dir = db_path
    .parent()
    .ok_or_else(|| eyre!("Invalid database path: {}", db_path.display()))?
    .to_path_buf();
  std::fs::create_dir_all(&log_dir)?;
  let _guard = init_logging(&log_dir, args.verbose);

  let mut engine = SyncEngine::open(config)?;

  match args.command {
    Command::Fetch {
      method,
      url,
      data,
      headers,
      navigate,
    } => {
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::new(method, url)
      };
      for (name, value) in headers {
        request = request.with_header(name, value);
      }
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }

      let response = engine.fetch(request).await?;
      eprintln!("{} ({:?})", response.status, response.source);
      println!("{}", String::from_utf8_lossy(&response.body));
    }
    Command::Queue => {
      let pending = engine.pending()?;
      if pending.is_empty() {
        println!("Queue is empty");
      }
      for m in pending {
        println!(
          "{}  {:<6} {}  retries={}  queued={}",
          m.id,
          m.method,
          m.url,
          m.retry_count,
          m.enqueued_at.to_rfc3339()
        );
      }
    }
    Command::DeadLetters { purge, revive } => {
      let queue = engine.queue();
      if purge {
        println!("Purged {} dead letters", queue.purge_dead_letters()?);
      } else if let Some(id) = revive {
        match queue.revive(&id)? {
          Some(m) => println!("Requeued {} as {}", id, m.id),
          None => return Err(eyre!("No dead letter with id {}", id)),
        }
      } else {
        for d in engine.dead_letters()? {
          println!(
            "{}  {:<6} {}  dropped={}  error={}",
            d.mutation.id,
            d.mutation.method,
            d.mutation.url,
            d.dropped_at.to_rfc3339(),
            d.last_error
          );
        }
      }
    }
    Command::Sync => {
      println!("{:?}", engine.sync_now().await?);
    }
    Command::Install => {
      let report = engine.install().await?;
      println!(
        "Cached {}, failed {}, purged {} old partitions",
        report.cached.len(),
        report.failed.len(),
        report.purged.len()
      );
      for url in report.failed {
        println!("  failed: {}", url);
      }
    }
    Command::Watch => {
      let tasks = engine.spawn_background()?;
      println!("Watching, press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      tasks.abort();
    }
  }

  Ok(())
}
