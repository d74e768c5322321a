use async_trait::async_trait;
use futures::{future::poll_fn, Stream};
use hyper::{
  body::{Bytes, HttpBody},
  client::conn::{Builder, SendRequest},
  Body, Request, Response,
};
use log::debug;
use pin_project::{pin_project, pinned_drop};
use std::{
  fmt, io,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  task::{Context, Poll},
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};

#[derive(Debug, Error)]
pub enum ConnectError {
  #[error("failed to connect: {0}")]
  Io(#[from] io::Error),
  #[error("handshake failed: {0}")]
  Handshake(#[from] hyper::Error),
}

/// An established connection to one backend
#[async_trait]
pub trait BackendConnection: Send + Sync + fmt::Debug {
  fn is_open(&self) -> bool;

  /// Closes the connection. Calling this more than once has no further effect.
  fn close(&self);

  async fn send_request(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error>;

  /// Waits until the connection can take another request. False if it died in the meantime, even though `is_open`
  /// may not have noticed yet.
  async fn is_ready(&self) -> bool;

  /// HTTP/2 connections need absolute request URIs, HTTP/1 connections get origin-form ones
  fn is_http2(&self) -> bool {
    false
  }
}

#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
  async fn connect(&self, address: &str) -> Result<Arc<dyn BackendConnection>, ConnectError>;
}

/// Opens plain TCP connections and runs hyper's client protocol on top
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
  http2: bool,
}

impl HttpConnector {
  pub fn new(http2: bool) -> HttpConnector {
    HttpConnector { http2 }
  }
}

#[async_trait]
impl Connector for HttpConnector {
  async fn connect(&self, address: &str) -> Result<Arc<dyn BackendConnection>, ConnectError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    let mut builder = Builder::new();
    builder.http2_only(self.http2);
    let (sender, connection) = builder.handshake::<_, Body>(stream).await?;

    let closed = Arc::new(AtomicBool::new(false));
    let driver = {
      let closed = closed.clone();
      let address = address.to_string();
      tokio::spawn(async move {
        // resolves early when the backend switches protocols, handing the socket to the upgrade
        if let Err(e) = connection.await {
          debug!("connection to {} ended: {}", address, e);
        }
        closed.store(true, Ordering::Release);
      })
    };

    Ok(Arc::new(HyperConnection {
      address: address.to_string(),
      sender: Mutex::new(sender),
      closed,
      driver,
      http2: self.http2,
    }))
  }
}

pub struct HyperConnection {
  address: String,
  sender: Mutex<SendRequest<Body>>,
  closed: Arc<AtomicBool>,
  driver: JoinHandle<()>,
  http2: bool,
}

impl fmt::Debug for HyperConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HyperConnection")
      .field("address", &self.address)
      .field("closed", &self.closed)
      .field("http2", &self.http2)
      .finish()
  }
}

#[async_trait]
impl BackendConnection for HyperConnection {
  fn is_open(&self) -> bool {
    !self.closed.load(Ordering::Acquire)
  }

  fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      debug!("closing connection to {}", self.address);
      self.driver.abort();
    }
  }

  async fn send_request(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    // only wait for readiness under the lock, the response itself is awaited without it
    let response = {
      let mut sender = self.sender.lock().await;
      if let Err(e) = poll_fn(|cx| sender.poll_ready(cx)).await {
        self.closed.store(true, Ordering::Release);
        return Err(e);
      }
      sender.send_request(request)
    };
    response.await
  }

  async fn is_ready(&self) -> bool {
    let mut sender = self.sender.lock().await;
    match poll_fn(|cx| sender.poll_ready(cx)).await {
      Ok(()) => true,
      Err(e) => {
        debug!("connection to {} is no longer usable: {}", self.address, e);
        self.closed.store(true, Ordering::Release);
        false
      }
    }
  }

  fn is_http2(&self) -> bool {
    self.http2
  }
}

impl Drop for HyperConnection {
  fn drop(&mut self) {
    self.driver.abort();
  }
}

/// Whatever a response body keeps alive while it is streamed
pub trait BodyGuard: Send + 'static {
  /// Called when the body is dropped before the backend sent all of it
  fn body_abandoned(&self);
}

/// A response body which keeps `guard` alive until the body has been streamed completely or dropped
#[pin_project(PinnedDrop)]
pub struct GuardedBody<G: BodyGuard> {
  #[pin]
  inner: Body,
  guard: G,
  finished: bool,
}

impl<G: BodyGuard> Stream for GuardedBody<G> {
  type Item = Result<Bytes, hyper::Error>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.project();
    let polled = this.inner.poll_next(cx);
    if let Poll::Ready(None) = polled {
      *this.finished = true;
    }
    polled
  }
}

#[pinned_drop]
impl<G: BodyGuard> PinnedDrop for GuardedBody<G> {
  fn drop(self: Pin<&mut Self>) {
    let this = self.project();
    if !*this.finished && !this.inner.is_end_stream() {
      this.guard.body_abandoned();
    }
  }
}

pub fn hold_until_streamed<G: BodyGuard>(response: Response<Body>, guard: G) -> Response<Body> {
  let (parts, body) = response.into_parts();
  let body = Body::wrap_stream(GuardedBody {
    inner: body,
    guard,
    finished: false,
  });
  Response::from_parts(parts, body)
}
