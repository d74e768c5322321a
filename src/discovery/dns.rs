use super::{BackendDirectory, DirectoryError, ServiceEndpoint};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::lookup_host;

const DEFAULT_PORT: u16 = 80;

/// Treats the route name as a `host[:port]` and uses every address the resolver returns as an endpoint
#[derive(Debug, Default)]
pub struct DnsDirectory {}

impl DnsDirectory {
  pub fn new() -> DnsDirectory {
    DnsDirectory {}
  }
}

fn with_default_port(route: &str) -> String {
  if route.rsplit_once(':').map_or(false, |(_, port)| port.parse::<u16>().is_ok()) {
    route.to_string()
  } else {
    format!("{}:{}", route, DEFAULT_PORT)
  }
}

#[async_trait]
impl BackendDirectory for DnsDirectory {
  async fn find_endpoints(&self, route: &str, timeout: Duration) -> Result<Vec<ServiceEndpoint>, DirectoryError> {
    let host = with_default_port(route);
    match tokio::time::timeout(timeout, lookup_host(host)).await {
      Ok(Ok(addresses)) => Ok(addresses.map(|address| ServiceEndpoint::seen_now(address.to_string())).collect()),
      Ok(Err(source)) => Err(DirectoryError::Resolve {
        route: route.to_string(),
        source,
      }),
      Err(_) => Ok(Vec::new()),
    }
  }
}
