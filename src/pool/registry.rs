use super::{BackendPool, PoolConfig};
use crate::http_client::Connector;
use dashmap::DashMap;
use log::info;
use std::{sync::Arc, time::Duration};

/// Owns one `BackendPool` per backend address for the lifetime of the process
#[derive(Debug)]
pub struct PoolRegistry {
  pools: DashMap<String, Arc<BackendPool>>,
  config: Arc<PoolConfig>,
  connector: Arc<dyn Connector>,
}

impl PoolRegistry {
  pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> PoolRegistry {
    PoolRegistry {
      pools: DashMap::new(),
      config: Arc::new(config),
      connector,
    }
  }

  /// Returns the pool of `address`, creating it on first use. Concurrent callers always get the same instance.
  pub fn get_or_create(&self, address: &str) -> Arc<BackendPool> {
    if let Some(pool) = self.get(address) {
      return pool;
    }

    self
      .pools
      .entry(address.to_string())
      .or_insert_with(|| {
        info!("creating connection pool for backend {}", address);
        Arc::new(BackendPool::new(address, self.config.clone(), self.connector.clone()))
      })
      .value()
      .clone()
  }

  pub fn get(&self, address: &str) -> Option<Arc<BackendPool>> {
    self.pools.get(address).map(|pool| pool.value().clone())
  }

  pub fn len(&self) -> usize {
    self.pools.len()
  }

  pub fn purge_idle(&self) -> usize {
    // collect first, so no shard lock is held while connections are closed
    let pools: Vec<Arc<BackendPool>> = self.pools.iter().map(|pool| pool.value().clone()).collect();
    pools.iter().map(|pool| pool.purge_idle()).sum()
  }
}

/// Periodically drops expired and surplus idle connections of every pool
pub async fn watch_pools(registry: Arc<PoolRegistry>, interval: Duration) {
  let mut interval_timer = tokio::time::interval(interval);
  loop {
    interval_timer.tick().await;
    let closed = registry.purge_idle();
    if closed > 0 {
      info!("closed {} idle connections across {} backends", closed, registry.len());
    }
  }
}
