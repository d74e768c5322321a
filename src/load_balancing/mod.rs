use crate::{
  discovery::ServiceEndpoint,
  pool::{registry::PoolRegistry, Availability, AvailabilitySource, BackendPool},
};
use std::{collections::HashSet, sync::Arc};

pub mod freshest;
pub mod random_start;

/// Addresses already tried for one exchange. Lives exactly as long as the exchange.
#[derive(Debug, Default, Clone)]
pub struct AttemptHistory {
  tried: HashSet<String>,
}

impl AttemptHistory {
  pub fn new() -> AttemptHistory {
    AttemptHistory::default()
  }

  pub fn record(&mut self, address: &str) {
    self.tried.insert(address.to_string());
  }

  pub fn contains(&self, address: &str) -> bool {
    self.tried.contains(address)
  }

  pub fn len(&self) -> usize {
    self.tried.len()
  }
}

/// Decides in which order the candidates of a route are looked at
pub trait CandidateOrder: std::fmt::Debug + Send + Sync {
  /// Returns a permutation of `0..endpoints.len()`
  fn order(&self, endpoints: &[ServiceEndpoint]) -> Vec<usize>;
}

/// Where the selector gets the pool of a candidate address from
pub trait PoolSource {
  type Pool: AvailabilitySource;

  fn pool_for(&self, address: &str) -> Arc<Self::Pool>;
}

impl PoolSource for PoolRegistry {
  type Pool = BackendPool;

  fn pool_for(&self, address: &str) -> Arc<BackendPool> {
    self.get_or_create(address)
  }
}

/// Picks the backend for the next attempt of an exchange.
///
/// The first available pool in candidate order wins. Failing that, the first full pool is preferred over the first
/// pool which is a problem server or has a full queue.
#[derive(Debug)]
pub struct TargetSelector {
  order: Box<dyn CandidateOrder>,
}

impl TargetSelector {
  pub fn new(order: Box<dyn CandidateOrder>) -> TargetSelector {
    TargetSelector { order }
  }

  pub fn select<S: PoolSource>(
    &self,
    endpoints: &[ServiceEndpoint],
    attempts: &AttemptHistory,
    pools: &S,
  ) -> Option<Arc<S::Pool>> {
    if endpoints.is_empty() {
      return None;
    }

    let mut candidate_full = None;
    let mut candidate_issues = None;

    for index in self.order.order(endpoints) {
      let address = &endpoints[index].address;
      if attempts.contains(address) {
        continue;
      }

      let pool = pools.pool_for(address);
      match pool.availability() {
        Availability::Available => return Some(pool),
        Availability::Full if candidate_full.is_none() => candidate_full = Some(pool),
        Availability::Problem | Availability::FullQueue if candidate_issues.is_none() => candidate_issues = Some(pool),
        _ => {}
      }
    }

    candidate_full.or(candidate_issues)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::{cell::RefCell, collections::HashMap};

  /// Fixed order, handy to make tie-breaks visible
  #[derive(Debug)]
  pub struct InOrder;

  impl CandidateOrder for InOrder {
    fn order(&self, endpoints: &[ServiceEndpoint]) -> Vec<usize> {
      (0..endpoints.len()).collect()
    }
  }

  #[derive(Debug)]
  pub struct FakePool {
    address: String,
    availability: Availability,
  }

  impl AvailabilitySource for FakePool {
    fn address(&self) -> &str {
      &self.address
    }

    fn availability(&self) -> Availability {
      self.availability
    }
  }

  #[derive(Default)]
  struct FakePools {
    availability: HashMap<String, Availability>,
    lookups: RefCell<Vec<String>>,
  }

  impl FakePools {
    fn new(pools: &[(&str, Availability)]) -> FakePools {
      FakePools {
        availability: pools.iter().map(|(a, av)| (a.to_string(), *av)).collect(),
        lookups: RefCell::new(Vec::new()),
      }
    }
  }

  impl PoolSource for FakePools {
    type Pool = FakePool;

    fn pool_for(&self, address: &str) -> Arc<FakePool> {
      self.lookups.borrow_mut().push(address.to_string());
      Arc::new(FakePool {
        address: address.to_string(),
        availability: self.availability[address],
      })
    }
  }

  fn endpoints(addresses: &[&str]) -> Vec<ServiceEndpoint> {
    addresses.iter().map(|a| ServiceEndpoint::seen_now(*a)).collect()
  }

  fn selected<S: PoolSource>(selector: &TargetSelector, pools: &S, addresses: &[&str], tried: &[&str]) -> Option<String> {
    let mut attempts = AttemptHistory::new();
    tried.iter().for_each(|address| attempts.record(address));
    selector
      .select(&endpoints(addresses), &attempts, pools)
      .map(|pool| pool.address().to_string())
  }

  use Availability::*;

  #[test]
  fn empty_candidates_select_nothing() {
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &FakePools::default(), &[], &[]), None);
  }

  #[test]
  fn first_available_wins_and_stops_scan() {
    let pools = FakePools::new(&[("a", Problem), ("b", Available), ("c", Available)]);
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &pools, &["a", "b", "c"], &[]), Some("b".into()));
    assert_eq!(*pools.lookups.borrow(), vec!["a", "b"]);
  }

  #[test]
  fn full_beats_problem_and_full_queue() {
    let pools = FakePools::new(&[("a", Problem), ("b", FullQueue), ("c", Full), ("d", Full)]);
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &pools, &["a", "b", "c", "d"], &[]), Some("c".into()));
  }

  #[test]
  fn first_issue_candidate_is_last_resort() {
    let pools = FakePools::new(&[("a", FullQueue), ("b", Problem)]);
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &pools, &["a", "b"], &[]), Some("a".into()));
    assert_eq!(selected(&selector, &pools, &["b", "a"], &[]), Some("b".into()));
  }

  #[test]
  fn tried_addresses_are_skipped() {
    let pools = FakePools::new(&[("a", Available), ("b", Problem)]);
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &pools, &["a", "b"], &["a"]), Some("b".into()));
    assert!(!pools.lookups.borrow().contains(&"a".to_string()));
  }

  #[test]
  fn all_tried_selects_nothing() {
    let pools = FakePools::new(&[("a", Available), ("b", Available)]);
    let selector = TargetSelector::new(Box::new(InOrder));

    assert_eq!(selected(&selector, &pools, &["a", "b"], &["a", "b"]), None);
  }

  #[test]
  fn random_start_always_prefers_available() {
    let pools = FakePools::new(&[("a", Problem), ("b", Full), ("c", Available), ("d", FullQueue)]);
    let selector = TargetSelector::new(Box::new(random_start::RandomStart::new()));

    for _ in 0..100 {
      assert_eq!(selected(&selector, &pools, &["a", "b", "c", "d"], &[]), Some("c".into()));
    }
  }

  #[test]
  fn random_start_never_returns_tried_address() {
    let pools = FakePools::new(&[("a", Available), ("b", Problem), ("c", Full)]);
    let selector = TargetSelector::new(Box::new(random_start::RandomStart::new()));

    for _ in 0..100 {
      assert_eq!(selected(&selector, &pools, &["a", "b", "c"], &["a"]), Some("c".into()));
    }
  }

  #[test]
  fn registry_as_pool_source() {
    use crate::{pool::PoolConfig, test_utils::MockConnector};

    let registry = PoolRegistry::new(PoolConfig::default(), Arc::new(MockConnector::new()));
    let selector = TargetSelector::new(Box::new(InOrder));

    let pool = selector
      .select(&endpoints(&["127.0.0.1:1"]), &AttemptHistory::new(), &registry)
      .unwrap();

    assert_eq!(pool.address(), "127.0.0.1:1");
    assert!(Arc::ptr_eq(&pool, &registry.get("127.0.0.1:1").unwrap()));
  }
}
