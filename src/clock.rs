//! Time sources.
//!
//! Everything that compares timestamps (feed staleness, cached-at stamps,
//! fallback age limits) reads time through a `Clock` so tests can move time
//! by hand.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Current time as milliseconds since the Unix epoch.
  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Start at the Unix epoch, which keeps millisecond arithmetic in tests readable.
  pub fn at_epoch() -> Self {
    Self::new(DateTime::<Utc>::UNIX_EPOCH)
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::at_epoch();
    assert_eq!(clock.now_millis(), 0);

    clock.advance(Duration::seconds(1000));
    assert_eq!(clock.now_millis(), 1_000_000);
  }

  #[test]
  fn test_manual_clock_set() {
    let clock = ManualClock::at_epoch();
    let later = DateTime::<Utc>::UNIX_EPOCH + Duration::days(2);
    clock.set(later);
    assert_eq!(clock.now(), later);
  }
}
