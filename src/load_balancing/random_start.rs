use super::CandidateOrder;
use crate::discovery::ServiceEndpoint;
use rand::{thread_rng, Rng};

/// Scans all candidates circularly from a random index, so identical candidate lists don't always favour the first
#[derive(Debug, Default)]
pub struct RandomStart {}

impl RandomStart {
  pub fn new() -> RandomStart {
    RandomStart {}
  }
}

impl CandidateOrder for RandomStart {
  fn order(&self, endpoints: &[ServiceEndpoint]) -> Vec<usize> {
    let len = endpoints.len();
    if len == 0 {
      return Vec::new();
    }
    let start = thread_rng().gen_range(0..len);
    (0..len).map(|offset| (start + offset) % len).collect()
  }
}
