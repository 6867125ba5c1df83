//! Sync status tracking.
//!
//! Polls the backend for the number of local mutations it has not
//! acknowledged yet and pairs that with the connectivity flag. Both are
//! advisory: nothing here ever blocks a caller.

mod source;

pub use source::{parse_count, HttpPendingCount, PendingCountSource};

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What the presentation layer needs to decide on an "unsaved data" warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
  /// Last known count of unacknowledged local mutations
  pub pending: u64,
  pub online: bool,
  /// Time of the last successful poll
  pub last_synced: Option<DateTime<Utc>>,
}

impl SyncStatus {
  /// True when local changes may not have been saved remotely.
  pub fn needs_attention(&self) -> bool {
    self.pending > 0 || !self.online
  }
}

/// Result of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
  Updated(u64),
  /// Offline, nothing asked
  Skipped,
  /// The query failed; the previous count stands
  Failed,
}

#[derive(Debug, Default)]
struct PollState {
  pending: u64,
  last_synced: Option<DateTime<Utc>>,
}

pub struct SyncStatusTracker {
  source: Arc<dyn PendingCountSource>,
  connectivity: ConnectivityMonitor,
  clock: Arc<dyn Clock>,
  interval: Duration,
  state: RwLock<PollState>,
}

impl SyncStatusTracker {
  pub fn new(
    source: Arc<dyn PendingCountSource>,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      source,
      connectivity,
      clock,
      interval: DEFAULT_POLL_INTERVAL,
      state: RwLock::new(PollState::default()),
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Last known pending count.
  pub fn pending(&self) -> u64 {
    self.state.read().unwrap_or_else(|e| e.into_inner()).pending
  }

  pub fn status(&self) -> SyncStatus {
    let state = self.state.read().unwrap_or_else(|e| e.into_inner());
    SyncStatus {
      pending: state.pending,
      online: self.connectivity.is_online(),
      last_synced: state.last_synced,
    }
  }

  /// Poll once now. Never fails; a failed query keeps the previous count.
  pub async fn refresh(&self) -> PollOutcome {
    if !self.connectivity.is_online() {
      debug!("Offline, skipping pending count poll");
      return PollOutcome::Skipped;
    }

    match self.source.pending_count().await {
      Ok(count) => {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.pending = count;
        state.last_synced = Some(self.clock.now());
        debug!(pending = count, "Pending count updated");
        PollOutcome::Updated(count)
      }
      Err(e) => {
        warn!(error = %e, pending = self.pending(), "Pending count poll failed, keeping last value");
        PollOutcome::Failed
      }
    }
  }

  /// Start polling on the current runtime, first poll immediately.
  ///
  /// Runs until the runtime shuts down or the handle is aborted.
  pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        self.refresh().await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::connectivity::ConnectivitySignal;
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Replays scripted results; `None` means the query fails.
  struct ScriptedSource {
    results: Mutex<VecDeque<Option<u64>>>,
    calls: AtomicUsize,
  }

  impl ScriptedSource {
    fn new(results: Vec<Option<u64>>) -> Self {
      Self {
        results: Mutex::new(results.into()),
        calls: AtomicUsize::new(0),
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl PendingCountSource for ScriptedSource {
    async fn pending_count(&self) -> Result<u64> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match self.results.lock().unwrap().pop_front().flatten() {
        Some(count) => Ok(count),
        None => Err(eyre!("backend unavailable")),
      }
    }
  }

  fn tracker(source: Arc<ScriptedSource>, online: bool) -> (SyncStatusTracker, ConnectivityMonitor) {
    let monitor = ConnectivityMonitor::new(online);
    let tracker = SyncStatusTracker::new(source, monitor.clone(), Arc::new(ManualClock::at_epoch()));
    (tracker, monitor)
  }

  #[tokio::test]
  async fn test_failed_poll_keeps_last_count() {
    let source = Arc::new(ScriptedSource::new(vec![Some(3), None]));
    let (tracker, _) = tracker(source, true);

    assert_eq!(tracker.refresh().await, PollOutcome::Updated(3));
    assert_eq!(tracker.refresh().await, PollOutcome::Failed);
    assert_eq!(tracker.pending(), 3);
    assert!(tracker.status().last_synced.is_some());
  }

  #[tokio::test]
  async fn test_offline_skips_poll() {
    let source = Arc::new(ScriptedSource::new(vec![Some(2), Some(5)]));
    let (tracker, monitor) = tracker(source.clone(), true);

    tracker.refresh().await;
    monitor.handle_signal(ConnectivitySignal::Offline);

    assert_eq!(tracker.refresh().await, PollOutcome::Skipped);
    assert_eq!(source.calls(), 1);

    let status = tracker.status();
    assert_eq!(status.pending, 2);
    assert!(!status.online);
    assert!(status.needs_attention());

    monitor.handle_signal(ConnectivitySignal::Online);
    assert_eq!(tracker.refresh().await, PollOutcome::Updated(5));
  }

  #[test]
  fn test_needs_attention() {
    let synced = SyncStatus {
      pending: 0,
      online: true,
      last_synced: None,
    };
    assert!(!synced.needs_attention());
    assert!(SyncStatus { pending: 1, ..synced }.needs_attention());
    assert!(SyncStatus { online: false, ..synced }.needs_attention());
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_loop_every_interval() {
    let source = Arc::new(ScriptedSource::new(vec![Some(3), None, Some(0)]));
    let (tracker, _) = tracker(source.clone(), true);
    let tracker = Arc::new(tracker);
    let handle = Arc::clone(&tracker).spawn();

    // t=0: first tick fires immediately
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(tracker.pending(), 3);

    // t=10s: query fails, count unchanged
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(tracker.pending(), 3);

    // t=20s: backend caught up
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), 3);
    assert_eq!(tracker.pending(), 0);

    handle.abort();
  }
}
