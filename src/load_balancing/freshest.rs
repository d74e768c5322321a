use super::CandidateOrder;
use crate::discovery::ServiceEndpoint;

/// Looks at the candidate discovery heard from most recently first
#[derive(Debug, Default)]
pub struct Freshest {}

impl Freshest {
  pub fn new() -> Freshest {
    Freshest {}
  }
}

impl CandidateOrder for Freshest {
  fn order(&self, endpoints: &[ServiceEndpoint]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..endpoints.len()).collect();
    indices.sort_by(|a, b| endpoints[*b].last_seen_at.cmp(&endpoints[*a].last_seen_at));
    indices
  }
}
