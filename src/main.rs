mod app;
mod commands;

use clap::Parser;
use color_eyre::Result;
use offcache::config::Config;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline caching and sync for a web application")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory holding the cache databases
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Application origin, overrides the config file
  #[arg(long)]
  origin: Option<String>,

  /// Deployed version, overrides the config file
  #[arg(long = "app-version")]
  app_version: Option<String>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  /// Log at info level unless RUST_LOG says otherwise
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Set up logging. Keep the returned guard alive so file logs get flushed.
fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  // RUST_LOG wins over -v
  let default = if verbose { "info" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose, args.log_dir.as_deref());

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.app_version {
    config.version = version;
  }
  if let Some(data_dir) = args.data_dir {
    config.data_dir = Some(data_dir);
  }
  config.origin_url()?;

  info!(origin = %config.origin, version = %config.version, "offcache starting");

  let app = app::App::new(config).await?;
  app.run(args.command).await?;

  Ok(())
}
