use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{io, time::Duration};
use thiserror::Error;

pub mod dns;
pub mod file;
pub mod memory;

/// A backend instance as last reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
  pub address: String,
  pub last_seen_at: DateTime<Utc>,
}

impl ServiceEndpoint {
  pub fn new<A: Into<String>>(address: A, last_seen_at: DateTime<Utc>) -> ServiceEndpoint {
    ServiceEndpoint {
      address: address.into(),
      last_seen_at,
    }
  }

  pub fn seen_now<A: Into<String>>(address: A) -> ServiceEndpoint {
    ServiceEndpoint::new(address, Utc::now())
  }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
  #[error("waiting for service endpoints was cancelled")]
  Cancelled,
  #[error("failed to resolve route {route}: {source}")]
  Resolve {
    route: String,
    #[source]
    source: io::Error,
  },
}

/// Source of the currently known endpoints of a route.
///
/// Implementations wait at most `timeout` for at least one endpoint to show up and return an empty list otherwise.
/// Callers treat every error as "no backend available right now".
#[async_trait]
pub trait BackendDirectory: Send + Sync + std::fmt::Debug {
  async fn find_endpoints(&self, route: &str, timeout: Duration) -> Result<Vec<ServiceEndpoint>, DirectoryError>;
}
