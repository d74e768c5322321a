use clap::Parser;
use configuration::{CommandLine, Settings};
use http_client::HttpConnector;
use listeners::Http;
use load_balancing::TargetSelector;
use log::{error, info};
use pool::registry::{watch_pools, PoolRegistry};
use proxy::Proxy;
use std::{error::Error, sync::Arc, time::Duration};

mod configuration;
mod discovery;
mod error_response;
mod http_client;
mod listeners;
mod load_balancing;
mod logging;
mod pool;
mod proxy;
mod route_table;
mod server;
mod sticky;
#[cfg(test)]
mod test_utils;

const POOL_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
  logging::initialize()?;

  let settings = match Settings::load(CommandLine::parse()) {
    Ok(settings) => settings,
    Err(e) => {
      error!("Invalid configuration: {}", e);
      return Err(e.into());
    }
  };
  info!(
    "{} routes, {:?} discovery, {:?} selection, {} max connections per backend",
    settings.routes.len(),
    settings.discovery,
    settings.selection,
    settings.pool.max_connections
  );

  let directory = settings.directory()?;
  let pools = Arc::new(PoolRegistry::new(
    settings.pool.clone(),
    Arc::new(HttpConnector::new(settings.backend_http2)),
  ));
  tokio::spawn(watch_pools(pools.clone(), POOL_HOUSEKEEPING_INTERVAL));

  let proxy = Arc::new(Proxy::new(
    settings.routes,
    directory,
    TargetSelector::new(settings.selection.order()),
    pools,
    settings.timeouts,
  ));

  let http = Http {
    tracker: proxy.sticky().clone(),
  };
  let acceptor = http.produce_acceptor(settings.listen).await?;
  info!("Listening on {}", acceptor.local_addr());

  server::create(acceptor, proxy).await?;
  Ok(())
}
