use color_eyre::{eyre::eyre, Result};
use offcache::cache::{CacheSource, CacheStorage, SqliteStorage};
use offcache::clock::{Clock, SystemClock};
use offcache::config::Config;
use offcache::connectivity::{self, ConnectivityMonitor, ConnectivitySignal};
use offcache::feed::StructuredFeedCache;
use offcache::http::{Network, ReqwestNetwork, Request};
use offcache::sync::{HttpPendingCount, SyncStatus, SyncStatusTracker};
use offcache::worker::{
  Activation, CacheGeneration, ControlMessage, InterceptorOptions, Phase, RequestInterceptor,
};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::commands::{Command, FeedAction};

type Interceptor = RequestInterceptor<SqliteStorage>;

/// Wires the offline components together for one CLI invocation
pub struct App {
  config: Config,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
  /// Cache generations only; activation purges never see the feed
  worker_storage: Arc<SqliteStorage>,
  feed: StructuredFeedCache<SqliteStorage, Value>,
  connectivity: ConnectivityMonitor,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let network: Arc<dyn Network> = Arc::new(ReqwestNetwork::new(config.request_timeout())?);
    let worker_storage = Arc::new(SqliteStorage::open(&config.worker_cache_path()?)?);
    let local_storage = Arc::new(SqliteStorage::open(&config.local_store_path()?)?);

    // Seed the flag once; afterwards only explicit signals change it
    let online = connectivity::probe(&config.origin_url()?, Duration::from_secs(3)).await;

    Self::from_parts(
      config,
      network,
      Arc::new(SystemClock),
      worker_storage,
      local_storage,
      online,
    )
  }

  pub fn from_parts(
    config: Config,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    worker_storage: Arc<SqliteStorage>,
    local_storage: Arc<SqliteStorage>,
    online: bool,
  ) -> Result<Self> {
    let feed =
      StructuredFeedCache::new(local_storage, Arc::clone(&clock)).with_ttl(config.feed_ttl()?);

    Ok(Self {
      config,
      network,
      clock,
      worker_storage,
      feed,
      connectivity: ConnectivityMonitor::new(online),
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Install => self.install().await,
      Command::Fetch { path, method, data } => self.fetch(&path, &method, data).await,
      Command::Generations => self.generations(),
      Command::Entries => self.entries(),
      Command::Message { message } => self.message(message).await,
      Command::Feed { action } => match action {
        FeedAction::Refresh => self.feed_refresh().await,
        FeedAction::Show => self.feed_show(),
        FeedAction::Clear => {
          self.feed.clear();
          println!("Feed snapshot cleared");
          Ok(())
        }
        FeedAction::Status => {
          self.feed_status();
          Ok(())
        }
      },
      Command::Status => self.status().await,
      Command::Watch => self.watch().await,
    }
  }

  fn generation(&self) -> CacheGeneration {
    CacheGeneration::for_version(
      &self.config.worker.generation_prefix,
      &self.config.version,
      self.config.worker.manifest.clone(),
    )
  }

  fn options(&self) -> Result<InterceptorOptions> {
    let mut options = InterceptorOptions::new(self.config.origin_url()?);
    options.api_prefix = self.config.worker.api_prefix.clone();
    options.skip_waiting_on_install = self.config.worker.skip_waiting_on_install;
    options.generation_prefix = self.config.worker.generation_prefix.clone();
    options.fallback_max_age = self.config.fallback_max_age()?;
    Ok(options)
  }

  fn build(&self, generation: CacheGeneration) -> Result<Interceptor> {
    Ok(RequestInterceptor::new(
      generation,
      self.options()?,
      Arc::clone(&self.worker_storage),
      Arc::clone(&self.network),
      Arc::clone(&self.clock),
    ))
  }

  fn resume(&self, generation: CacheGeneration) -> Result<Interceptor> {
    Ok(RequestInterceptor::resume(
      generation,
      self.options()?,
      Arc::clone(&self.worker_storage),
      Arc::clone(&self.network),
      Arc::clone(&self.clock),
    )?)
  }

  /// Interceptor for the configured version.
  ///
  /// If that generation is the one recorded as active it is resumed as is.
  /// Otherwise the manifest is precached and activation attempted; the
  /// returned instance may be waiting or redundant.
  async fn prepare(&self) -> Result<Interceptor> {
    let generation = self.generation();
    if self.worker_storage.active_namespace()?.as_deref() == Some(generation.name()) {
      return self.resume(generation);
    }

    let interceptor = self.build(generation)?;
    if let Err(e) = interceptor.install().await {
      warn!(error = %e, "Install failed, older generation stays in control");
      return Ok(interceptor);
    }

    match interceptor.activate().await? {
      Activation::Activated { purged } => {
        info!(generation = interceptor.generation().name(), ?purged, "Generation active")
      }
      Activation::Deferred => info!(
        generation = interceptor.generation().name(),
        "Generation installed, waiting for SKIP_WAITING"
      ),
    }
    Ok(interceptor)
  }

  /// Interceptor that answers requests.
  ///
  /// Falls back to the generation recorded as active while the configured
  /// one is waiting or failed to install. Waiting generations never serve.
  /// Without an active generation requests pass straight through.
  async fn controller(&self) -> Result<Interceptor> {
    let current = self.prepare().await?;
    if current.is_controlling() {
      return Ok(current);
    }

    match self.worker_storage.active_namespace()? {
      Some(name) if name != current.generation().name() => {
        info!(generation = %name, "Serving from active generation");
        self.resume(CacheGeneration::new(name, self.config.worker.manifest.clone()))
      }
      _ => Ok(current),
    }
  }

  async fn install(&self) -> Result<()> {
    let interceptor = self.prepare().await?;
    let name = interceptor.generation().name();
    match interceptor.phase() {
      Phase::Redundant => Err(eyre!("Install of {} failed", name)),
      Phase::Waiting => {
        println!("{} installed, waiting (send SKIP_WAITING to activate)", name);
        Ok(())
      }
      phase => {
        println!("{} {:?}", name, phase);
        Ok(())
      }
    }
  }

  async fn fetch(&self, path: &str, method: &str, data: Option<String>) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
    let mut request = Request::new(method, self.config.resolve(path)?);
    if let Some(data) = data {
      request = request.with_body(data);
    }

    let interceptor = self.controller().await?;
    let result = interceptor.handle_fetch(request).await;
    interceptor.flush().await;
    let result = result?;

    match result.cached_at {
      Some(at) => eprintln!("{} ({}, cached {})", result.data.status, result.source, at),
      None => eprintln!("{} ({})", result.data.status, result.source),
    }
    println!("{}", result.data.text());
    Ok(())
  }

  fn generations(&self) -> Result<()> {
    let active = self.worker_storage.active_namespace()?;
    for name in self.worker_storage.namespaces()? {
      let marker = if active.as_deref() == Some(name.as_str()) { "*" } else { " " };
      println!("{} {}", marker, name);
    }
    Ok(())
  }

  fn entries(&self) -> Result<()> {
    for key in self.worker_storage.keys(self.generation().name())? {
      println!("{}", key);
    }
    Ok(())
  }

  async fn message(&self, message: ControlMessage) -> Result<()> {
    let interceptor = self.prepare().await?;
    match interceptor.handle_message(message).await? {
      Some(Activation::Activated { purged }) => {
        println!("{} activated", interceptor.generation().name());
        for name in purged {
          println!("  purged {}", name);
        }
      }
      Some(Activation::Deferred) | None => {
        println!("{} {:?}", interceptor.generation().name(), interceptor.phase())
      }
    }
    Ok(())
  }

  async fn feed_refresh(&self) -> Result<()> {
    let url = self.config.resolve(&self.config.feed.path)?;
    let interceptor = self.controller().await?;
    let result = interceptor.handle_fetch(Request::get(url)).await;
    interceptor.flush().await;
    let result = result?;

    if !result.data.is_success() {
      return Err(eyre!("Feed request failed with status {}", result.data.status));
    }
    if result.source != CacheSource::Network {
      println!("Feed unavailable ({}), snapshot unchanged", result.source);
      self.feed_status();
      return Ok(());
    }

    let items: Vec<Value> = serde_json::from_slice(&result.data.body)
      .map_err(|e| eyre!("Feed response is not a JSON array: {}", e))?;
    let count = items.len();
    self.feed.capture(items);
    println!("Captured {} feed items", count);
    Ok(())
  }

  fn feed_show(&self) -> Result<()> {
    if self.feed.is_stale() {
      eprintln!("Feed snapshot is stale ({})", self.feed.age_display());
    }
    for item in self.feed.read() {
      println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
  }

  fn feed_status(&self) {
    match self.feed.snapshot() {
      Some(snapshot) => println!(
        "feed: {} items, captured {} ({}), {}",
        snapshot.items.len(),
        snapshot
          .captured_at()
          .map(|at| at.to_rfc3339())
          .unwrap_or_else(|| "unknown".to_string()),
        self.feed.age_display(),
        if self.feed.is_stale() { "stale" } else { "fresh" }
      ),
      None => println!("feed: no snapshot"),
    }
  }

  fn tracker(&self) -> Result<SyncStatusTracker> {
    let url = self.config.resolve(&self.config.sync.pending_path)?;
    let source = Arc::new(HttpPendingCount::new(Arc::clone(&self.network), url));
    Ok(
      SyncStatusTracker::new(source, self.connectivity.clone(), Arc::clone(&self.clock))
        .with_interval(Duration::from_secs(self.config.sync.interval_secs)),
    )
  }

  async fn status(&self) -> Result<()> {
    let tracker = self.tracker()?;
    tracker.refresh().await;
    print_status(&tracker.status());
    self.feed_status();
    Ok(())
  }

  /// Poll until ctrl-c. Lines `online` / `offline` on stdin act as
  /// connectivity signals.
  async fn watch(&self) -> Result<()> {
    let tracker = Arc::new(self.tracker()?);
    let poller = Arc::clone(&tracker).spawn();

    let mut signals = BufReader::new(tokio::io::stdin()).lines();
    let mut connectivity = self.connectivity.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last: Option<SyncStatus> = None;
    let mut stdin_open = true;

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        line = signals.next_line(), if stdin_open => match line {
          Ok(Some(line)) => match line.parse::<ConnectivitySignal>() {
            Ok(signal) => self.connectivity.handle_signal(signal),
            Err(e) => warn!(error = %e, "Ignoring input"),
          },
          Ok(None) => stdin_open = false,
          Err(e) => {
            warn!(error = %e, "Failed to read connectivity signals");
            stdin_open = false;
          }
        },
        Ok(()) = connectivity.changed() => {
          // Poll right away when the connection comes back
          if *connectivity.borrow_and_update() {
            tracker.refresh().await;
          }
        }
        _ = ticker.tick() => {}
      }

      let status = tracker.status();
      if last != Some(status) {
        print_status(&status);
        last = Some(status);
      }
    }

    poller.abort();
    Ok(())
  }
}

fn print_status(status: &SyncStatus) {
  let synced = status
    .last_synced
    .map(|at| at.to_rfc3339())
    .unwrap_or_else(|| "never".to_string());
  println!(
    "{} | pending: {} | last sync: {}{}",
    if status.online { "online" } else { "offline" },
    status.pending,
    synced,
    if status.needs_attention() { " | unsaved changes" } else { "" }
  );
}
