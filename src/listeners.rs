use crate::sticky::{ClientId, StickyTracker};
use async_stream::stream;
use futures::Stream;
use log::{debug, error};
use pin_project::{pin_project, pinned_drop};
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  net::{TcpListener, TcpStream},
};

pub struct HyperAcceptor<'a> {
  acceptor: Pin<Box<dyn Stream<Item = Result<ClientStream, io::Error>> + Send + 'a>>,
  local_addr: SocketAddr,
}

impl HyperAcceptor<'_> {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
}

impl hyper::server::accept::Accept for HyperAcceptor<'_> {
  type Conn = ClientStream;
  type Error = io::Error;

  fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    Pin::new(&mut self.acceptor).poll_next(cx)
  }
}

/// Accepts plain TCP client connections. Every connection gets its own `ClientId` and releases its sticky binding
/// when it goes away.
pub struct Http {
  pub tracker: Arc<StickyTracker>,
}

impl Http {
  pub async fn produce_acceptor(self, address: SocketAddr) -> Result<HyperAcceptor<'static>, io::Error> {
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    let tracker = self.tracker;

    let incoming_stream = stream! {
      loop {
        match listener.accept().await {
          Ok((socket, remote_addr)) => {
            if let Err(e) = socket.set_nodelay(true) {
              debug!("failed to set TCP_NODELAY for {}: {}", remote_addr, e);
            }
            yield Ok(ClientStream::new(socket, remote_addr, tracker.clone()));
          }
          Err(e) => error!("Failed to accept client connection: {}", e),
        }
      }
    };

    Ok(HyperAcceptor {
      acceptor: Box::pin(incoming_stream),
      local_addr,
    })
  }
}

/// A client connection which tells the sticky tracker once it is closed
#[pin_project(PinnedDrop)]
pub struct ClientStream {
  #[pin]
  inner: TcpStream,
  client: ClientId,
  remote_addr: SocketAddr,
  tracker: Arc<StickyTracker>,
}

impl ClientStream {
  pub fn new(inner: TcpStream, remote_addr: SocketAddr, tracker: Arc<StickyTracker>) -> ClientStream {
    let client = tracker.register_client();
    ClientStream {
      inner,
      client,
      remote_addr,
      tracker,
    }
  }

  pub fn client_id(&self) -> ClientId {
    self.client
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }
}

#[pinned_drop]
impl PinnedDrop for ClientStream {
  fn drop(self: Pin<&mut Self>) {
    let this = self.project();
    this.tracker.release(*this.client);
  }
}

impl AsyncRead for ClientStream {
  fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_read(cx, buf)
  }
}

impl AsyncWrite for ClientStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }

  fn poll_write_vectored(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    self.project().inner.poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    pool::{BackendPool, PoolConfig},
    test_utils::MockConnector,
  };
  use futures::StreamExt;
  use hyper::server::accept::Accept;
  use std::time::Duration;

  #[tokio::test]
  async fn accepted_connections_get_distinct_ids_and_release_on_close() {
    let tracker = Arc::new(StickyTracker::new());
    let http = Http {
      tracker: tracker.clone(),
    };
    let mut acceptor = http.produce_acceptor("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let address = acceptor.local_addr();

    let _first_client = TcpStream::connect(address).await.unwrap();
    let _second_client = TcpStream::connect(address).await.unwrap();
    let mut accepted = futures::stream::poll_fn(|cx| Pin::new(&mut acceptor).poll_accept(cx));
    let first = accepted.next().await.unwrap().unwrap();
    let second = accepted.next().await.unwrap().unwrap();

    assert_ne!(first.client_id(), second.client_id());
    assert_eq!(first.remote_addr().ip(), address.ip());

    let pool = Arc::new(BackendPool::new(
      "127.0.0.1:1",
      Arc::new(PoolConfig::default()),
      Arc::new(MockConnector::new()),
    ));
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let pinned = tracker.bind(first.client_id(), "orders", lease);
    drop(first);

    assert_eq!(tracker.len(), 0);
    assert!(!pinned.is_open());
    drop(second);
  }
}
