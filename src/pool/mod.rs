use crate::http_client::{BackendConnection, BodyGuard, ConnectError, Connector};
use hyper::{Body, Request, Response};
use log::{debug, info, warn};
use std::{
  collections::VecDeque,
  fmt,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};
use thiserror::Error;
use tokio::{
  sync::{Notify, OwnedSemaphorePermit, Semaphore},
  time::Instant,
};

pub mod health;
pub mod registry;

use health::ErrorState;

/// Limits shared by every backend pool of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// How long a backend counts as a problem server after a failed connect
  pub problem_server_retry: Duration,
  /// Hard limit of open connections per backend
  pub max_connections: usize,
  /// Housekeeping closes idle connections until a backend holds no more than this many
  pub soft_max_connections: usize,
  /// Idle connections kept for reuse per backend
  pub max_cached_connections: usize,
  /// Requests allowed to wait for a connection once `max_connections` is reached
  pub max_queue_size: usize,
  /// Idle connections older than this are discarded, `None` keeps them forever
  pub connection_ttl: Option<Duration>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    PoolConfig {
      problem_server_retry: Duration::from_secs(2),
      max_connections: 200,
      soft_max_connections: 20,
      max_cached_connections: 40,
      max_queue_size: 40,
      connection_ttl: Some(Duration::from_secs(53)),
    }
  }
}

/// How willing a backend is to take another request, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
  Available,
  Full,
  FullQueue,
  Problem,
}

impl fmt::Display for Availability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Availability::Available => write!(f, "available"),
      Availability::Full => write!(f, "full"),
      Availability::FullQueue => write!(f, "full queue"),
      Availability::Problem => write!(f, "problem"),
    }
  }
}

pub trait AvailabilitySource {
  fn address(&self) -> &str;

  /// Must not block, it is called for every candidate of every request
  fn availability(&self) -> Availability;
}

#[derive(Debug, Error)]
pub enum AcquireError {
  #[error("timed out waiting for a connection")]
  Timeout,
  #[error("connection queue is full")]
  QueueFull,
  #[error(transparent)]
  Refused(#[from] ConnectError),
}

struct IdleConnection {
  connection: Arc<dyn BackendConnection>,
  permit: OwnedSemaphorePermit,
  idle_since: Instant,
}

enum Slot {
  Reused(PooledConnection),
  Fresh(OwnedSemaphorePermit),
}

/// Connection pool and health state of a single backend address.
///
/// Every open connection, idle or leased, holds one permit of `permits`. Idle connections are reused most recently
/// released first.
pub struct BackendPool {
  address: String,
  config: Arc<PoolConfig>,
  connector: Arc<dyn Connector>,
  permits: Arc<Semaphore>,
  idle: Mutex<VecDeque<IdleConnection>>,
  idle_count: AtomicUsize,
  queued: AtomicUsize,
  idle_ready: Notify,
  errors: ErrorState,
}

impl fmt::Debug for BackendPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BackendPool")
      .field("address", &self.address)
      .field("open", &self.open_connections())
      .field("idle", &self.idle_connections())
      .field("queued", &self.queued_requests())
      .field("problem", &self.errors.is_problem())
      .finish()
  }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

impl BackendPool {
  pub fn new<A: Into<String>>(address: A, config: Arc<PoolConfig>, connector: Arc<dyn Connector>) -> BackendPool {
    BackendPool {
      address: address.into(),
      permits: Arc::new(Semaphore::new(config.max_connections)),
      errors: ErrorState::new(config.problem_server_retry),
      config,
      connector,
      idle: Mutex::new(VecDeque::new()),
      idle_count: AtomicUsize::new(0),
      queued: AtomicUsize::new(0),
      idle_ready: Notify::new(),
    }
  }

  pub fn open_connections(&self) -> usize {
    self.config.max_connections - self.permits.available_permits()
  }

  pub fn idle_connections(&self) -> usize {
    self.idle_count.load(Ordering::Acquire)
  }

  pub fn queued_requests(&self) -> usize {
    self.queued.load(Ordering::Acquire)
  }

  /// Marks the backend as a problem server, as a failed connect would
  pub fn report_error(&self) {
    if self.errors.record_error() {
      info!("backend {} is now a problem server", self.address);
    }
  }

  /// Hands out a connection to this backend, reusing an idle one if possible.
  ///
  /// Waits at most `timeout`, for a free slot as well as for the connect itself. If the backend is at
  /// `max_connections` and `max_queue_size` requests are already waiting, fails right away.
  pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection, AcquireError> {
    let deadline = Instant::now() + timeout;
    match self.reserve(deadline).await? {
      Slot::Reused(connection) => Ok(connection),
      Slot::Fresh(permit) => self.open(permit, deadline).await,
    }
  }

  async fn reserve(self: &Arc<Self>, deadline: Instant) -> Result<Slot, AcquireError> {
    if let Some(connection) = self.take_idle() {
      return Ok(Slot::Reused(connection));
    }
    if let Ok(permit) = self.permits.clone().try_acquire_owned() {
      return Ok(Slot::Fresh(permit));
    }

    if self.queued.fetch_add(1, Ordering::AcqRel) >= self.config.max_queue_size {
      self.queued.fetch_sub(1, Ordering::AcqRel);
      return Err(AcquireError::QueueFull);
    }
    let _slot = QueueSlot(&self.queued);

    loop {
      let idle_ready = self.idle_ready.notified();
      tokio::pin!(idle_ready);
      idle_ready.as_mut().enable();

      if let Some(connection) = self.take_idle() {
        return Ok(Slot::Reused(connection));
      }

      tokio::select! {
        permit = self.permits.clone().acquire_owned() => {
          return permit.map(Slot::Fresh).map_err(|_| AcquireError::Timeout);
        }
        _ = &mut idle_ready => continue,
        _ = tokio::time::sleep_until(deadline) => return Err(AcquireError::Timeout),
      }
    }
  }

  async fn open(self: &Arc<Self>, permit: OwnedSemaphorePermit, deadline: Instant) -> Result<PooledConnection, AcquireError> {
    match tokio::time::timeout_at(deadline, self.connector.connect(&self.address)).await {
      Ok(Ok(connection)) => {
        if self.errors.clear() {
          info!("backend {} recovered", self.address);
        }
        debug!("opened connection to {} ({} open)", self.address, self.open_connections());
        Ok(PooledConnection::new(self.clone(), connection, permit))
      }
      Ok(Err(e)) => {
        debug!("failed to connect to backend {}: {}", self.address, e);
        self.report_error();
        Err(AcquireError::Refused(e))
      }
      Err(_) => {
        warn!("timed out connecting to backend {}", self.address);
        self.report_error();
        Err(AcquireError::Timeout)
      }
    }
  }

  fn is_expired(&self, idle: &IdleConnection, now: Instant) -> bool {
    self
      .config
      .connection_ttl
      .map_or(false, |ttl| now.duration_since(idle.idle_since) >= ttl)
  }

  fn take_idle(self: &Arc<Self>) -> Option<PooledConnection> {
    let now = Instant::now();
    let mut idle = self.idle.lock().ok()?;
    while let Some(entry) = idle.pop_back() {
      self.idle_count.fetch_sub(1, Ordering::AcqRel);
      if entry.connection.is_open() && !self.is_expired(&entry, now) {
        let mut connection = PooledConnection::new(self.clone(), entry.connection, entry.permit);
        connection.reused = true;
        return Some(connection);
      }
      entry.connection.close();
    }
    None
  }

  fn release(&self, connection: Arc<dyn BackendConnection>, permit: OwnedSemaphorePermit) {
    if !connection.is_open() {
      return;
    }

    let cached = match self.idle.lock() {
      Ok(mut idle) if idle.len() < self.config.max_cached_connections => {
        idle.push_back(IdleConnection {
          connection: connection.clone(),
          permit,
          idle_since: Instant::now(),
        });
        self.idle_count.fetch_add(1, Ordering::AcqRel);
        true
      }
      _ => false,
    };

    if cached {
      self.idle_ready.notify_one();
    } else {
      connection.close();
    }
  }

  /// Closes idle connections past their time to live, then the oldest idle ones while the backend holds more than
  /// `soft_max_connections`. Returns how many were closed.
  pub fn purge_idle(&self) -> usize {
    let now = Instant::now();
    let mut closed = Vec::new();
    if let Ok(mut idle) = self.idle.lock() {
      let mut open = self.open_connections();
      let mut kept = VecDeque::with_capacity(idle.len());
      while let Some(entry) = idle.pop_front() {
        if !entry.connection.is_open() || self.is_expired(&entry, now) || open > self.config.soft_max_connections {
          open = open.saturating_sub(1);
          closed.push(entry);
        } else {
          kept.push_back(entry);
        }
      }
      self.idle_count.store(kept.len(), Ordering::Release);
      *idle = kept;
    }

    for entry in &closed {
      entry.connection.close();
    }
    if !closed.is_empty() {
      debug!("closed {} idle connections to {}", closed.len(), self.address);
    }
    closed.len()
  }
}

impl AvailabilitySource for BackendPool {
  fn address(&self) -> &str {
    &self.address
  }

  fn availability(&self) -> Availability {
    if self.errors.is_problem() {
      Availability::Problem
    } else if self.permits.available_permits() > 0 || self.idle_connections() > 0 {
      Availability::Available
    } else if self.queued_requests() >= self.config.max_queue_size {
      Availability::FullQueue
    } else {
      Availability::Full
    }
  }
}

/// A connection leased from a `BackendPool`. Goes back to the pool when dropped, unless it was closed.
pub struct PooledConnection {
  pool: Arc<BackendPool>,
  connection: Arc<dyn BackendConnection>,
  permit: Option<OwnedSemaphorePermit>,
  reused: bool,
}

impl fmt::Debug for PooledConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PooledConnection")
      .field("address", &self.pool.address)
      .field("connection", &self.connection)
      .field("reused", &self.reused)
      .finish()
  }
}

impl PooledConnection {
  fn new(pool: Arc<BackendPool>, connection: Arc<dyn BackendConnection>, permit: OwnedSemaphorePermit) -> Self {
    PooledConnection {
      pool,
      connection,
      permit: Some(permit),
      reused: false,
    }
  }

  pub fn address(&self) -> &str {
    &self.pool.address
  }

  pub fn is_open(&self) -> bool {
    self.connection.is_open()
  }

  pub fn is_http2(&self) -> bool {
    self.connection.is_http2()
  }

  /// Whether the connection sat idle in the pool before this lease
  pub fn is_reused(&self) -> bool {
    self.reused
  }

  pub async fn is_ready(&self) -> bool {
    self.connection.is_ready().await
  }

  pub fn close(&self) {
    self.connection.close();
  }

  pub async fn send_request(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    self.connection.send_request(request).await
  }
}

impl Drop for PooledConnection {
  fn drop(&mut self) {
    if let Some(permit) = self.permit.take() {
      self.pool.release(self.connection.clone(), permit);
    }
  }
}

impl BodyGuard for Arc<PooledConnection> {
  /// An HTTP/1 connection is useless once a response on it was cut short. HTTP/2 only resets the stream.
  fn body_abandoned(&self) {
    if !self.is_http2() {
      debug!("response from {} dropped before it was complete, closing its connection", self.address());
      self.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::MockConnector;
  use tokio_test::{assert_err, assert_ok};

  fn config(max_connections: usize, max_queue_size: usize) -> Arc<PoolConfig> {
    Arc::new(PoolConfig {
      max_connections,
      max_queue_size,
      soft_max_connections: max_connections,
      max_cached_connections: max_connections,
      ..PoolConfig::default()
    })
  }

  fn pool(config: Arc<PoolConfig>, connector: MockConnector) -> Arc<BackendPool> {
    Arc::new(BackendPool::new("127.0.0.1:1", config, Arc::new(connector)))
  }

  #[tokio::test]
  async fn fresh_pool_is_available() {
    let pool = pool(config(2, 1), MockConnector::new());

    assert_eq!(pool.availability(), Availability::Available);
    assert_eq!(pool.open_connections(), 0);
  }

  #[tokio::test]
  async fn released_connection_is_reused() {
    let connector = MockConnector::new();
    let pool = pool(config(2, 1), connector.clone());

    let first = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    drop(first);
    assert_eq!(pool.idle_connections(), 1);
    let _second = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    assert_eq!(connector.connects(), 1);
    assert_eq!(pool.idle_connections(), 0);
    assert_eq!(pool.open_connections(), 1);
  }

  #[tokio::test]
  async fn idle_connection_is_marked_reused() {
    let pool = pool(config(2, 1), MockConnector::new());

    let first = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    assert!(!first.is_reused());
    drop(first);

    assert!(assert_ok!(pool.acquire(Duration::from_secs(1)).await).is_reused());
  }

  #[tokio::test]
  async fn abandoned_response_closes_http1_connection() {
    let pool = pool(config(2, 1), MockConnector::new());
    let leased = Arc::new(assert_ok!(pool.acquire(Duration::from_secs(1)).await));

    leased.body_abandoned();
    drop(leased);

    assert_eq!(pool.idle_connections(), 0);
    assert_eq!(pool.open_connections(), 0);
  }

  #[tokio::test]
  async fn abandoned_response_keeps_http2_connection() {
    let pool = pool(config(2, 1), MockConnector::http2());
    let leased = Arc::new(assert_ok!(pool.acquire(Duration::from_secs(1)).await));

    leased.body_abandoned();
    drop(leased);

    assert_eq!(pool.idle_connections(), 1);
  }

  #[tokio::test]
  async fn closed_connection_is_not_reused() {
    let connector = MockConnector::new();
    let pool = pool(config(2, 1), connector.clone());

    let first = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    first.close();
    drop(first);

    assert_eq!(pool.idle_connections(), 0);
    assert_eq!(pool.open_connections(), 0);
    let _second = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    assert_eq!(connector.connects(), 2);
  }

  #[tokio::test]
  async fn full_pool_reports_full_then_full_queue() {
    let pool = pool(config(1, 1), MockConnector::new());

    let leased = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    assert_eq!(pool.availability(), Availability::Full);

    let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|c| c.address().to_string()) })
    };
    while pool.queued_requests() == 0 {
      tokio::task::yield_now().await;
    }
    assert_eq!(pool.availability(), Availability::FullQueue);

    drop(leased);
    assert_eq!(assert_ok!(waiter.await.unwrap()), "127.0.0.1:1");
  }

  #[tokio::test]
  async fn full_queue_fails_fast() {
    let pool = pool(config(1, 0), MockConnector::new());
    let _leased = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    let result = pool.acquire(Duration::from_secs(5)).await;

    assert!(matches!(assert_err!(result), AcquireError::QueueFull));
  }

  #[tokio::test]
  async fn queued_request_times_out() {
    let pool = pool(config(1, 1), MockConnector::new());
    let _leased = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    let result = pool.acquire(Duration::from_millis(20)).await;

    assert!(matches!(assert_err!(result), AcquireError::Timeout));
    assert_eq!(pool.queued_requests(), 0);
  }

  #[tokio::test]
  async fn refused_connect_marks_problem() {
    let connector = MockConnector::refusing();
    let pool = pool(config(1, 1), connector);

    let result = pool.acquire(Duration::from_secs(1)).await;

    assert!(matches!(assert_err!(result), AcquireError::Refused(_)));
    assert_eq!(pool.availability(), Availability::Problem);
    assert_eq!(pool.open_connections(), 0);
  }

  #[tokio::test]
  async fn slow_connect_times_out_and_marks_problem() {
    let connector = MockConnector::new().with_delay(Duration::from_secs(5));
    let pool = pool(config(1, 1), connector);

    let result = pool.acquire(Duration::from_millis(20)).await;

    assert!(matches!(assert_err!(result), AcquireError::Timeout));
    assert_eq!(pool.availability(), Availability::Problem);
  }

  #[tokio::test]
  async fn successful_connect_clears_problem() {
    let pool = pool(config(1, 1), MockConnector::new());
    pool.report_error();
    assert_eq!(pool.availability(), Availability::Problem);

    let _leased = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    assert_eq!(pool.availability(), Availability::Full);
  }

  #[tokio::test]
  async fn expired_idle_connection_is_discarded() {
    let connector = MockConnector::new();
    let config = Arc::new(PoolConfig {
      connection_ttl: Some(Duration::from_millis(10)),
      ..PoolConfig::default()
    });
    let pool = pool(config, connector.clone());

    drop(assert_ok!(pool.acquire(Duration::from_secs(1)).await));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _leased = assert_ok!(pool.acquire(Duration::from_secs(1)).await);

    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.open_connections(), 1);
  }

  #[tokio::test]
  async fn cache_limit_closes_surplus_connections() {
    let connector = MockConnector::new();
    let config = Arc::new(PoolConfig {
      max_cached_connections: 1,
      ..PoolConfig::default()
    });
    let pool = pool(config, connector);

    let first = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    let second = assert_ok!(pool.acquire(Duration::from_secs(1)).await);
    drop(first);
    drop(second);

    assert_eq!(pool.idle_connections(), 1);
    assert_eq!(pool.open_connections(), 1);
  }

  #[tokio::test]
  async fn purge_shrinks_to_soft_max() {
    let config = Arc::new(PoolConfig {
      soft_max_connections: 1,
      ..PoolConfig::default()
    });
    let pool = pool(config, MockConnector::new());

    let leased: Vec<_> = futures::future::join_all((0..3).map(|_| pool.acquire(Duration::from_secs(1))))
      .await
      .into_iter()
      .map(|result| result.unwrap())
      .collect();
    drop(leased);
    assert_eq!(pool.idle_connections(), 3);

    assert_eq!(pool.purge_idle(), 2);
    assert_eq!(pool.idle_connections(), 1);
    assert_eq!(pool.open_connections(), 1);
  }
}
