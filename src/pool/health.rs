use std::{
  sync::atomic::{AtomicBool, AtomicU64, Ordering},
  time::{Duration, Instant},
};

/// Remembers the last connect failure of a backend. A backend stays a problem server until `retry_after` has passed.
///
/// All operations are lock-free, so availability checks never contend with connection setup.
#[derive(Debug)]
pub struct ErrorState {
  epoch: Instant,
  retry_after: Duration,
  problem: AtomicBool,
  // nanoseconds since `epoch`
  last_error: AtomicU64,
}

impl ErrorState {
  pub fn new(retry_after: Duration) -> ErrorState {
    ErrorState {
      epoch: Instant::now(),
      retry_after,
      problem: AtomicBool::new(false),
      last_error: AtomicU64::new(0),
    }
  }

  fn now(&self) -> u64 {
    self.epoch.elapsed().as_nanos() as u64
  }

  /// Returns true if the backend was fine before
  pub fn record_error(&self) -> bool {
    let was_fine = !self.is_problem();
    self.last_error.store(self.now(), Ordering::Release);
    self.problem.store(true, Ordering::Release);
    was_fine
  }

  /// Returns true if the backend was a problem server before
  pub fn clear(&self) -> bool {
    self.problem.swap(false, Ordering::AcqRel)
  }

  pub fn is_problem(&self) -> bool {
    if !self.problem.load(Ordering::Acquire) {
      return false;
    }
    let since_error = self.now().saturating_sub(self.last_error.load(Ordering::Acquire));
    since_error < self.retry_after.as_nanos() as u64
  }
}
