//! Request interceptor with a versioned cache generation.
//!
//! One `RequestInterceptor` exists per deployed version. It moves through
//! install (precache the manifest), activate (purge older generations and
//! take control) and then answers every request with a per-class strategy:
//! - non-GET requests go straight to the network
//! - GETs under the API prefix are network-first with cache fallback
//! - every other GET is cache-first

mod error;
mod generation;
mod message;
mod strategy;

pub use error::WorkerError;
pub use generation::{CacheGeneration, DEFAULT_GENERATION_PREFIX, DEFAULT_MANIFEST};
pub use message::ControlMessage;
pub use strategy::Strategy;

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::clock::Clock;
use crate::http::{CachedResponse, Network, NetworkError, Request, Response};

/// Lifecycle phase of an interceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Parsed,
  Installing,
  Installed,
  /// Installed, but waiting for permission to take over
  Waiting,
  Activating,
  Activated,
  /// Install failed; this instance will never serve requests
  Redundant,
}

/// Outcome of an activation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
  /// Now in control; lists the generations that were purged
  Activated { purged: Vec<String> },
  /// Waiting for a skip-waiting command
  Deferred,
}

#[derive(Debug, Clone)]
pub struct InterceptorOptions {
  /// Origin that relative manifest entries resolve against
  pub origin: Url,
  /// Path prefix of dynamic endpoints
  pub api_prefix: String,
  /// Only namespaces with this prefix are generations; activation purges
  /// nothing else
  pub generation_prefix: String,
  /// Skip the waiting phase as soon as install completes
  pub skip_waiting_on_install: bool,
  /// Oldest cached response a network-first fallback may serve
  pub fallback_max_age: Option<Duration>,
}

impl InterceptorOptions {
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      api_prefix: "/api/".to_string(),
      generation_prefix: DEFAULT_GENERATION_PREFIX.to_string(),
      skip_waiting_on_install: true,
      fallback_max_age: None,
    }
  }
}

#[derive(Debug)]
struct WorkerState {
  phase: Phase,
  skip_waiting: bool,
  controlling: bool,
}

/// Serves one cache generation out of `storage`.
///
/// Activation deletes every namespace in `storage` that carries the
/// generation prefix, so unrelated data may share the store as long as its
/// namespace names don't use that prefix.
pub struct RequestInterceptor<S: CacheStorage> {
  generation: CacheGeneration,
  options: InterceptorOptions,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
  layer: CacheLayer<S>,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage + 'static> RequestInterceptor<S> {
  pub fn new(
    generation: CacheGeneration,
    options: InterceptorOptions,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&clock), generation.name())
      .with_fallback_max_age(options.fallback_max_age);

    Self {
      generation,
      options,
      storage,
      network,
      clock,
      layer,
      state: Mutex::new(WorkerState {
        phase: Phase::Parsed,
        skip_waiting: false,
        controlling: false,
      }),
    }
  }

  /// Resume an interceptor whose generation is already installed and active,
  /// e.g. after a process restart. Fails if the generation is missing.
  pub fn resume(
    generation: CacheGeneration,
    options: InterceptorOptions,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self, WorkerError> {
    let known = storage
      .namespaces()
      .map_err(|e| WorkerError::Storage(e.to_string()))?;
    if !known.iter().any(|name| name == generation.name()) {
      return Err(WorkerError::MissingGeneration(generation.name().to_string()));
    }

    let interceptor = Self::new(generation, options, storage, network, clock);
    {
      let mut state = interceptor.lock_state();
      state.phase = Phase::Activated;
      state.skip_waiting = true;
      state.controlling = true;
    }
    Ok(interceptor)
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn phase(&self) -> Phase {
    self.lock_state().phase
  }

  /// True once this instance has claimed control of clients.
  pub fn is_controlling(&self) -> bool {
    self.lock_state().controlling
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_phase(&self, phase: Phase) {
    self.lock_state().phase = phase;
  }

  /// Precache every manifest resource into the current generation.
  ///
  /// All resources are fetched before anything is written; a single failure
  /// aborts the install and leaves the instance redundant.
  pub async fn install(&self) -> Result<(), WorkerError> {
    {
      let mut state = self.lock_state();
      if state.phase != Phase::Parsed {
        return Err(WorkerError::InvalidPhase {
          operation: "install",
          phase: state.phase,
        });
      }
      state.phase = Phase::Installing;
    }

    info!(generation = self.generation.name(), "Installing cache generation");

    match self.precache().await {
      Ok(count) => {
        let mut state = self.lock_state();
        state.phase = Phase::Installed;
        if self.options.skip_waiting_on_install {
          state.skip_waiting = true;
        }
        info!(generation = self.generation.name(), resources = count, "Installed");
        Ok(())
      }
      Err(e) => {
        warn!(generation = self.generation.name(), error = %e, "Install failed");
        self.set_phase(Phase::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize, WorkerError> {
    let urls = self
      .generation
      .manifest_urls(&self.options.origin)
      .map_err(|e| WorkerError::Manifest(e.to_string()))?;

    let fetches = urls.into_iter().map(|url| {
      let network = Arc::clone(&self.network);
      async move {
        let request = Request::get(url.clone());
        let response = network
          .fetch(&request)
          .await
          .map_err(|source| WorkerError::PrecacheFetch {
            resource: url.clone(),
            source,
          })?;
        if !response.is_cacheable() {
          return Err(WorkerError::PrecacheStatus {
            resource: url,
            status: response.status,
          });
        }
        Ok((request.cache_key(), response))
      }
    });
    let fetched = try_join_all(fetches).await?;
    let count = fetched.len();

    let name = self.generation.name().to_string();
    let now = self.clock.now();
    self
      .blocking(move |storage| write_generation(storage, &name, &fetched, now))
      .await?;

    Ok(count)
  }

  /// Run storage work on the blocking pool.
  async fn blocking<T, F>(&self, work: F) -> Result<T, WorkerError>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, WorkerError> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || work(&storage))
      .await
      .map_err(|e| WorkerError::Storage(format!("Storage task failed: {}", e)))?
  }

  /// Take over from older generations.
  ///
  /// Without permission to skip waiting this only moves to `Waiting`.
  /// Otherwise this generation is marked active, every other generation is
  /// deleted (best effort) and this instance claims control of clients.
  pub async fn activate(&self) -> Result<Activation, WorkerError> {
    {
      let mut state = self.lock_state();
      match state.phase {
        Phase::Installed | Phase::Waiting => {}
        Phase::Activated => return Ok(Activation::Activated { purged: Vec::new() }),
        phase => {
          return Err(WorkerError::InvalidPhase {
            operation: "activate",
            phase,
          })
        }
      }

      if !state.skip_waiting {
        state.phase = Phase::Waiting;
        debug!(generation = self.generation.name(), "Activation deferred");
        return Ok(Activation::Deferred);
      }
      state.phase = Phase::Activating;
    }

    let current = self.generation.name().to_string();
    let prefix = self.options.generation_prefix.clone();
    let marked = self
      .blocking(move |storage| {
        storage
          .mark_active(&current)
          .map_err(|e| WorkerError::Storage(e.to_string()))?;
        Ok(purge_generations(storage, &current, &prefix))
      })
      .await;

    let purged = match marked {
      Ok(purged) => purged,
      Err(e) => {
        // Still in control for this process; a restart reinstalls
        warn!(generation = self.generation.name(), error = %e, "Failed to record active generation");
        Vec::new()
      }
    };

    {
      let mut state = self.lock_state();
      state.controlling = true;
      state.phase = Phase::Activated;
    }

    info!(
      generation = self.generation.name(),
      purged = purged.len(),
      "Activated and claimed clients"
    );
    Ok(Activation::Activated { purged })
  }

  /// Control channel.
  pub async fn handle_message(&self, message: ControlMessage) -> Result<Option<Activation>, WorkerError> {
    match message {
      ControlMessage::SkipWaiting => {
        let waiting = {
          let mut state = self.lock_state();
          state.skip_waiting = true;
          state.phase == Phase::Waiting
        };
        debug!(generation = self.generation.name(), waiting, "Skip waiting requested");

        if waiting {
          self.activate().await.map(Some)
        } else {
          Ok(None)
        }
      }
    }
  }

  /// Answer a request.
  ///
  /// Network errors reach the caller unchanged whenever no cached response
  /// can stand in for them.
  pub async fn handle_fetch(&self, request: Request) -> Result<CacheResult<Response>, NetworkError> {
    let strategy = if self.is_controlling() {
      strategy::select(&request, &self.options.api_prefix)
    } else {
      Strategy::Passthrough
    };

    let key = request.cache_key();
    let network = Arc::clone(&self.network);
    let fetch = || async move { network.fetch(&request).await };

    debug!(%key, ?strategy, "Intercepted request");

    match strategy {
      Strategy::Passthrough => fetch().await.map(CacheResult::from_network),
      Strategy::NetworkFirst => self.layer.network_first(&key, fetch).await,
      Strategy::CacheFirst => self.layer.cache_first(&key, fetch).await,
    }
  }

  /// Generation names currently in storage.
  pub fn generations(&self) -> color_eyre::Result<Vec<String>> {
    self.storage.namespaces()
  }

  /// Request identities stored in the current generation.
  pub fn entries(&self) -> color_eyre::Result<Vec<String>> {
    self.storage.keys(self.generation.name())
  }

  /// Wait for background cache writes to land.
  pub async fn flush(&self) {
    self.layer.flush().await;
  }
}

/// Precache writes into the generation's namespace.
///
/// A namespace created here is removed again if any write fails.
fn write_generation<S: CacheStorage>(
  storage: &S,
  name: &str,
  fetched: &[(String, Response)],
  cached_at: DateTime<Utc>,
) -> Result<(), WorkerError> {
  let existed = storage
    .namespaces()
    .map_err(|e| WorkerError::Storage(e.to_string()))?
    .iter()
    .any(|n| n == name);

  let written = storage.open_namespace(name).and_then(|_| {
    fetched.iter().try_for_each(|(key, response)| {
      storage.put_json(name, key, &CachedResponse::from_response(response), cached_at)
    })
  });

  if let Err(e) = written {
    if !existed {
      // Don't leave a half-filled generation behind
      if let Err(cleanup) = storage.delete_namespace(name) {
        warn!(generation = name, error = %cleanup, "Failed to remove partial generation");
      }
    }
    return Err(WorkerError::Storage(e.to_string()));
  }
  Ok(())
}

/// Delete every generation except `current`. Namespaces without the
/// generation prefix are left alone. Failures are logged and the
/// generation is left for the next activation.
fn purge_generations<S: CacheStorage>(storage: &S, current: &str, prefix: &str) -> Vec<String> {
  let names = match storage.namespaces() {
    Ok(names) => names,
    Err(e) => {
      warn!(error = %e, "Failed to enumerate cache generations");
      return Vec::new();
    }
  };

  let mut purged = Vec::new();
  for name in names {
    if name == current || !name.starts_with(prefix) {
      continue;
    }
    match storage.delete_namespace(&name) {
      Ok(_) => {
        debug!(generation = %name, "Deleted old cache generation");
        purged.push(name);
      }
      Err(e) => warn!(generation = %name, error = %e, "Failed to delete old cache generation"),
    }
  }
  purged
}
