use super::{BackendDirectory, DirectoryError, ServiceEndpoint};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::info;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

type Services = HashMap<String, Vec<ServiceEndpoint>>;

/// In-memory directory. Readers get a lock-free snapshot, writers swap in a new map and wake all waiters.
#[derive(Debug)]
pub struct StaticDirectory {
  services: ArcSwap<Services>,
  updated: Notify,
  shutdown: CancellationToken,
}

impl Default for StaticDirectory {
  fn default() -> Self {
    StaticDirectory::new()
  }
}

impl StaticDirectory {
  pub fn new() -> StaticDirectory {
    StaticDirectory {
      services: ArcSwap::from_pointee(HashMap::new()),
      updated: Notify::new(),
      shutdown: CancellationToken::new(),
    }
  }

  pub fn endpoints(&self, route: &str) -> Vec<ServiceEndpoint> {
    self.services.load().get(route).cloned().unwrap_or_default()
  }

  /// Adds `address` to `route` or refreshes its last seen timestamp
  pub fn announce(&self, route: &str, address: &str) {
    let endpoint = ServiceEndpoint::seen_now(address);
    self.services.rcu(|services| {
      let mut services = Services::clone(services);
      let endpoints = services.entry(route.to_string()).or_default();
      match endpoints.iter_mut().find(|known| known.address == endpoint.address) {
        Some(known) => known.last_seen_at = endpoint.last_seen_at,
        None => endpoints.push(endpoint.clone()),
      }
      services
    });
    self.updated.notify_waiters();
  }

  #[cfg(test)]
  pub fn withdraw(&self, route: &str, address: &str) {
    self.services.rcu(|services| {
      let mut services = Services::clone(services);
      if let Some(endpoints) = services.get_mut(route) {
        endpoints.retain(|known| known.address != address);
        if endpoints.is_empty() {
          services.remove(route);
        }
      }
      services
    });
  }

  /// Swaps in a complete route -> addresses listing. Addresses that were known before keep their timestamp.
  pub fn replace_all(&self, listing: HashMap<String, Vec<String>>) {
    let previous = self.services.load_full();
    let mut services = Services::new();
    for (route, addresses) in listing {
      let endpoints: Vec<ServiceEndpoint> = addresses
        .into_iter()
        .map(|address| {
          previous
            .get(&route)
            .and_then(|known| known.iter().find(|endpoint| endpoint.address == address))
            .cloned()
            .unwrap_or_else(|| ServiceEndpoint::seen_now(address))
        })
        .collect();
      if !endpoints.is_empty() {
        services.insert(route, endpoints);
      }
    }
    info!("service directory now knows {} routes", services.len());
    self.services.store(Arc::new(services));
    self.updated.notify_waiters();
  }

  /// Wakes every pending `find_endpoints` call with `DirectoryError::Cancelled`
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }
}

#[async_trait]
impl BackendDirectory for StaticDirectory {
  async fn find_endpoints(&self, route: &str, timeout: Duration) -> Result<Vec<ServiceEndpoint>, DirectoryError> {
    let deadline = Instant::now() + timeout;
    loop {
      // register for wakeups before looking, otherwise an update between the two is lost
      let notified = self.updated.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let endpoints = self.endpoints(route);
      if !endpoints.is_empty() {
        return Ok(endpoints);
      }

      tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => return Err(DirectoryError::Cancelled),
        _ = &mut notified => continue,
        _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
      }
    }
  }
}
