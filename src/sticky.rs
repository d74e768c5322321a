use crate::pool::{AvailabilitySource, BackendPool, PooledConnection};
use dashmap::{mapref::entry::Entry, DashMap};
use hyper::{header::UPGRADE, Body, Request, Version};
use log::debug;
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

/// Identifies one client-facing transport connection
pub type ClientId = u64;

/// HTTP/2 streams and upgraded exchanges have to stay on the backend they started on
pub fn requires_stickiness(request: &Request<Body>) -> bool {
  request.version() == Version::HTTP_2 || request.headers().contains_key(UPGRADE)
}

/// What a client connection is pinned to
#[derive(Debug, Clone)]
pub enum Pinned {
  /// Every exchange of the client goes over this connection. Used for upgrades and multiplexed backends.
  Connection(Arc<PooledConnection>),
  /// Every exchange of the client leases its own connection, always from this backend
  Backend(Arc<BackendPool>),
}

impl Pinned {
  pub fn address(&self) -> &str {
    match self {
      Pinned::Connection(connection) => connection.address(),
      Pinned::Backend(pool) => pool.address(),
    }
  }

  fn is_usable(&self) -> bool {
    match self {
      Pinned::Connection(connection) => connection.is_open(),
      Pinned::Backend(_) => true,
    }
  }
}

#[derive(Debug)]
struct StickyBinding {
  route: String,
  target: Pinned,
}

impl StickyBinding {
  /// Whether this binding stays in place when `target` gets bound for `route`. An open connection wins over a
  /// concurrently leased one, a backend only over itself.
  fn outlasts(&self, route: &str, target: &Pinned) -> bool {
    self.route == route
      && match (&self.target, target) {
        (Pinned::Connection(existing), Pinned::Connection(_)) => existing.is_open(),
        (Pinned::Backend(existing), Pinned::Backend(pool)) => Arc::ptr_eq(existing, pool),
        _ => false,
      }
  }
}

/// Pins client connections to backend connections or backends.
///
/// A binding is removed exactly once, either when it is replaced or when the client connection closes. Only the
/// latter closes a pinned backend connection, a replaced one goes back to its pool once no request uses it anymore.
#[derive(Debug, Default)]
pub struct StickyTracker {
  bindings: DashMap<ClientId, StickyBinding>,
  next_client: AtomicU64,
}

impl StickyTracker {
  pub fn new() -> StickyTracker {
    StickyTracker::default()
  }

  pub fn register_client(&self) -> ClientId {
    self.next_client.fetch_add(1, Ordering::Relaxed)
  }

  pub fn is_bound(&self, client: ClientId) -> bool {
    self.bindings.contains_key(&client)
  }

  /// Returns what `client` is pinned to if it was bound for `route`, skipping pinned connections which are closed
  pub fn lookup(&self, client: ClientId, route: &str) -> Option<Pinned> {
    let binding = self.bindings.get(&client)?;
    if binding.route == route && binding.target.is_usable() {
      Some(binding.target.clone())
    } else {
      None
    }
  }

  /// Pins `connection` to `client`. If the client already holds an open connection for the same route, that one
  /// wins and `connection` goes back to its pool.
  pub fn bind(&self, client: ClientId, route: &str, connection: PooledConnection) -> Arc<PooledConnection> {
    let connection = Arc::new(connection);
    match self.pin(client, route, Pinned::Connection(connection.clone())) {
      Pinned::Connection(pinned) => pinned,
      Pinned::Backend(_) => connection,
    }
  }

  /// Pins `client` to the backend behind `pool`, replacing whatever it was pinned to before
  pub fn bind_backend(&self, client: ClientId, route: &str, pool: &Arc<BackendPool>) {
    self.pin(client, route, Pinned::Backend(pool.clone()));
  }

  fn pin(&self, client: ClientId, route: &str, target: Pinned) -> Pinned {
    let replaced = match self.bindings.entry(client) {
      Entry::Occupied(mut entry) => {
        if entry.get().outlasts(route, &target) {
          return entry.get().target.clone();
        }
        Some(entry.insert(StickyBinding {
          route: route.to_string(),
          target: target.clone(),
        }))
      }
      Entry::Vacant(entry) => {
        entry.insert(StickyBinding {
          route: route.to_string(),
          target: target.clone(),
        });
        None
      }
    };

    match replaced {
      Some(replaced) => debug!(
        "client {} moves from {} on route {} to {} on route {}",
        client,
        replaced.target.address(),
        replaced.route,
        target.address(),
        route
      ),
      None => debug!("client {} pinned to {} on route {}", client, target.address(), route),
    }
    target
  }

  /// Drops the binding of a closed client connection and closes its pinned backend connection, if any. Safe to call
  /// any number of times, from any thread.
  pub fn release(&self, client: ClientId) {
    if let Some((_, binding)) = self.bindings.remove(&client) {
      match binding.target {
        Pinned::Connection(connection) => {
          debug!(
            "client {} closed, closing backend connection to {} ({} clients still pinned)",
            client,
            connection.address(),
            self.bindings.len()
          );
          connection.close();
        }
        Pinned::Backend(pool) => debug!(
          "client {} closed, unpinned from backend {} ({} clients still pinned)",
          client,
          pool.address(),
          self.bindings.len()
        ),
      }
    }
  }

  pub fn len(&self) -> usize {
    self.bindings.len()
  }
}
