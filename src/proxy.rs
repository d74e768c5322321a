use crate::{
  discovery::BackendDirectory,
  http_client::hold_until_streamed,
  load_balancing::{AttemptHistory, TargetSelector},
  pool::{registry::PoolRegistry, AcquireError, AvailabilitySource, BackendPool, PooledConnection},
  route_table::{Route, RouteTable},
  sticky::{requires_stickiness, ClientId, Pinned, StickyTracker},
};
use hyper::{
  header::{HeaderValue, HOST, UPGRADE},
  http::uri::{Authority, InvalidUri},
  upgrade::OnUpgrade,
  Body, Request, Response, StatusCode, Uri, Version,
};
use log::{debug, warn};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("no route matches the request path")]
  NoRoute,
  #[error("no backend available for route {0}")]
  BackendUnresolved(String),
  #[error("failed to connect to backend {address}: {source}")]
  ConnectFailed {
    address: String,
    #[source]
    source: AcquireError,
  },
  #[error("invalid request uri: {0}")]
  InvalidUri(#[from] InvalidUri),
  #[error("backend request failed: {0}")]
  Upstream(#[from] hyper::Error),
  #[error("request exceeded the maximum request time")]
  Timeout,
}

/// State of one exchange, passed along every step of proxying it
#[derive(Debug)]
pub struct ExchangeContext {
  pub client: ClientId,
  pub client_address: SocketAddr,
  pub attempts: AttemptHistory,
  original_path: String,
  authority: Option<Authority>,
  sticky: bool,
  upgrade: bool,
}

impl ExchangeContext {
  pub fn new(client: ClientId, client_address: SocketAddr, request: &Request<Body>) -> ExchangeContext {
    ExchangeContext {
      client,
      client_address,
      attempts: AttemptHistory::new(),
      original_path: request
        .uri()
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()),
      authority: request.uri().authority().cloned(),
      sticky: requires_stickiness(request),
      upgrade: request.headers().contains_key(UPGRADE),
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyTimeouts {
  /// Upper bound for waiting on discovery per attempt
  pub directory: Duration,
  /// Upper bound for an exchange from route lookup until response headers arrive
  pub max_request_time: Duration,
}

impl Default for ProxyTimeouts {
  fn default() -> Self {
    ProxyTimeouts {
      directory: Duration::from_secs(30),
      max_request_time: Duration::from_secs(30),
    }
  }
}

/// Finds a backend for every exchange and forwards the exchange to it
#[derive(Debug)]
pub struct Proxy {
  routes: RouteTable,
  directory: Arc<dyn BackendDirectory>,
  selector: TargetSelector,
  pools: Arc<PoolRegistry>,
  sticky: Arc<StickyTracker>,
  timeouts: ProxyTimeouts,
}

impl Proxy {
  pub fn new(
    routes: RouteTable,
    directory: Arc<dyn BackendDirectory>,
    selector: TargetSelector,
    pools: Arc<PoolRegistry>,
    timeouts: ProxyTimeouts,
  ) -> Proxy {
    Proxy {
      routes,
      directory,
      selector,
      pools,
      sticky: Arc::new(StickyTracker::new()),
      timeouts,
    }
  }

  pub fn sticky(&self) -> &Arc<StickyTracker> {
    &self.sticky
  }

  pub fn find_target(&self, path: &str) -> Option<Arc<Route>> {
    self.routes.resolve(path)
  }

  /// Makes one attempt at getting a backend connection for `request`.
  ///
  /// Reuses what the client is pinned to if it belongs to `route`. Otherwise selects a backend not tried before and
  /// leases a connection from its pool. Exchanges needing stickiness pin the client: upgrades and multiplexed backend
  /// connections pin the connection itself, otherwise only the backend is pinned and every exchange gets its own
  /// lease. A failed connect is recorded in the context, so calling this again tries another backend.
  pub async fn get_connection(
    &self,
    route: &Route,
    request: &mut Request<Body>,
    context: &mut ExchangeContext,
    timeout: Duration,
  ) -> Result<Arc<PooledConnection>, ProxyError> {
    *request.uri_mut() = route.rewrite(&context.original_path).parse::<Uri>()?;

    let pinned_backend = match self.sticky.lookup(context.client, route.name()) {
      Some(Pinned::Connection(connection)) => return Ok(connection),
      Some(Pinned::Backend(pool)) if !context.attempts.contains(pool.address()) => Some(pool),
      _ => None,
    };
    let pool = match &pinned_backend {
      Some(pool) => pool.clone(),
      None => self.select_backend(route, context, timeout).await?,
    };

    let pin = context.sticky || self.sticky.is_bound(context.client);
    match pool.acquire(timeout).await {
      Ok(connection) if context.upgrade || (pin && connection.is_http2()) => {
        Ok(self.sticky.bind(context.client, route.name(), connection))
      }
      Ok(connection) => {
        if pin && pinned_backend.is_none() {
          self.sticky.bind_backend(context.client, route.name(), &pool);
        }
        Ok(Arc::new(connection))
      }
      Err(source) => {
        context.attempts.record(pool.address());
        warn!(
          "failed to connect to backend {} for {}: {}",
          pool.address(),
          context.original_path,
          source
        );
        Err(ProxyError::ConnectFailed {
          address: pool.address().to_string(),
          source,
        })
      }
    }
  }

  async fn select_backend(
    &self,
    route: &Route,
    context: &ExchangeContext,
    timeout: Duration,
  ) -> Result<Arc<BackendPool>, ProxyError> {
    let endpoints = match self
      .directory
      .find_endpoints(route.name(), timeout.min(self.timeouts.directory))
      .await
    {
      Ok(endpoints) => endpoints,
      Err(e) => {
        debug!("no endpoints for route {}: {}", route.name(), e);
        return Err(ProxyError::BackendUnresolved(route.name().to_string()));
      }
    };

    self
      .selector
      .select(&endpoints, &context.attempts, self.pools.as_ref())
      .ok_or_else(|| {
        debug!(
          "could not resolve backend for route {} ({} known, {} tried)",
          route.name(),
          endpoints.len(),
          context.attempts.len()
        );
        ProxyError::BackendUnresolved(route.name().to_string())
      })
  }

  /// Repeats `get_connection` against further backends until one connects, no candidate is left or `deadline` passes.
  ///
  /// A connection which turns out to be dead before the request is sent is dropped. If it came from the idle cache the
  /// same backend is asked again, a fresh one counts as a failed attempt.
  pub async fn connect(
    &self,
    route: &Route,
    request: &mut Request<Body>,
    context: &mut ExchangeContext,
    deadline: Instant,
  ) -> Result<Arc<PooledConnection>, ProxyError> {
    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Err(ProxyError::Timeout);
      }
      let connection = match self.get_connection(route, request, context, remaining).await {
        Err(ProxyError::ConnectFailed { .. }) => continue,
        result => result?,
      };

      match tokio::time::timeout_at(deadline, connection.is_ready()).await {
        Ok(true) => return Ok(connection),
        Ok(false) => {
          connection.close();
          if connection.is_reused() {
            debug!("idle connection to {} went away, trying another one", connection.address());
          } else {
            debug!("fresh connection to {} went away before use", connection.address());
            context.attempts.record(connection.address());
          }
        }
        Err(_) => return Err(ProxyError::Timeout),
      }
    }
  }

  pub async fn forward(
    &self,
    mut request: Request<Body>,
    client: ClientId,
    client_address: SocketAddr,
  ) -> Result<Response<Body>, ProxyError> {
    let route = self.find_target(request.uri().path()).ok_or(ProxyError::NoRoute)?;
    let mut context = ExchangeContext::new(client, client_address, &request);
    let deadline = Instant::now() + self.timeouts.max_request_time;

    let client_upgrade = if request.headers().contains_key(UPGRADE) {
      Some(hyper::upgrade::on(&mut request))
    } else {
      None
    };

    let connection = self.connect(&route, &mut request, &mut context, deadline).await?;
    let backend_request = backend_request(request, &context, connection.is_http2(), connection.address())?;

    let mut response = match tokio::time::timeout_at(deadline, connection.send_request(backend_request)).await {
      Ok(response) => response?,
      Err(_) => return Err(ProxyError::Timeout),
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
      if let Some(client_upgrade) = client_upgrade {
        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(tunnel(client_upgrade, backend_upgrade, connection));
        return Ok(response);
      }
    }

    Ok(hold_until_streamed(response, connection))
  }
}

fn backend_request(
  request: Request<Body>,
  context: &ExchangeContext,
  http2: bool,
  address: &str,
) -> Result<Request<Body>, ProxyError> {
  let (mut parts, body) = request.into_parts();

  if !parts.headers.contains_key(HOST) {
    if let Some(value) = context
      .authority
      .as_ref()
      .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    {
      parts.headers.insert(HOST, value);
    }
  }
  if let Ok(value) = HeaderValue::from_str(&context.client_address.ip().to_string()) {
    parts.headers.append("x-forwarded-for", value);
  }

  if http2 {
    let path = parts.uri.path_and_query().map_or("/", |path| path.as_str());
    parts.uri = format!("http://{}{}", address, path).parse()?;
    parts.version = Version::HTTP_2;
  } else {
    parts.version = Version::HTTP_11;
  }

  Ok(Request::from_parts(parts, body))
}

/// Copies bytes both ways between an upgraded client and backend, holding on to the lease until either side is done
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, connection: Arc<PooledConnection>) {
  let address = connection.address();
  match futures::try_join!(client, backend) {
    Ok((mut client, mut backend)) => match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
      Ok((sent, received)) => debug!("tunnel to {} closed after {} bytes up, {} bytes down", address, sent, received),
      Err(e) => debug!("tunnel to {} failed: {}", address, e),
    },
    Err(e) => warn!("failed to upgrade connection to {}: {}", address, e),
  }
}
