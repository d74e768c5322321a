use crate::http_client::{BackendConnection, ConnectError, Connector};
use async_trait::async_trait;
use hyper::{body::to_bytes, Body, Request, Response};
use std::{
  collections::HashSet,
  io,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

/// Connector which never touches the network. Connections answer every request with `<address> <uri>`.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
  connects: Arc<AtomicUsize>,
  refused: Arc<Mutex<HashSet<String>>>,
  opened: Arc<Mutex<Vec<Arc<MockConnection>>>>,
  refuse_all: bool,
  delay: Option<Duration>,
  http2: bool,
}

impl MockConnector {
  pub fn new() -> MockConnector {
    MockConnector::default()
  }

  pub fn refusing() -> MockConnector {
    MockConnector {
      refuse_all: true,
      ..MockConnector::default()
    }
  }

  pub fn http2() -> MockConnector {
    MockConnector {
      http2: true,
      ..MockConnector::default()
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> MockConnector {
    self.delay = Some(delay);
    self
  }

  pub fn refuse(&self, address: &str) {
    self.refused.lock().unwrap().insert(address.to_string());
  }

  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }

  /// Lets every connection opened so far die the way an idle one does when the backend hangs up: it still looks
  /// open but fails the next request.
  pub fn hang_up(&self) {
    for connection in self.opened.lock().unwrap().iter() {
      connection.gone.store(true, Ordering::SeqCst);
    }
  }
}

#[async_trait]
impl Connector for MockConnector {
  async fn connect(&self, address: &str) -> Result<Arc<dyn BackendConnection>, ConnectError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.refuse_all || self.refused.lock().unwrap().contains(address) {
      return Err(ConnectError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
      )));
    }
    self.connects.fetch_add(1, Ordering::SeqCst);
    let connection = Arc::new(MockConnection::new(address, self.http2));
    self.opened.lock().unwrap().push(connection.clone());
    Ok(connection)
  }
}

#[derive(Debug)]
pub struct MockConnection {
  address: String,
  open: AtomicBool,
  gone: AtomicBool,
  http2: bool,
}

impl MockConnection {
  pub fn new(address: &str, http2: bool) -> MockConnection {
    MockConnection {
      address: address.to_string(),
      open: AtomicBool::new(true),
      gone: AtomicBool::new(false),
      http2,
    }
  }
}

#[async_trait]
impl BackendConnection for MockConnection {
  fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  fn close(&self) {
    self.open.store(false, Ordering::SeqCst);
  }

  async fn send_request(&self, request: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    if self.gone.load(Ordering::SeqCst) {
      // an aborted body is the simplest way to come by a hyper::Error
      let (sender, body) = Body::channel();
      sender.abort();
      to_bytes(body).await?;
    }
    let body = format!("{} {}", self.address, request.uri());
    Ok(Response::new(Body::from(body)))
  }

  async fn is_ready(&self) -> bool {
    if self.gone.load(Ordering::SeqCst) {
      self.close();
    }
    self.is_open()
  }

  fn is_http2(&self) -> bool {
    self.http2
  }
}
