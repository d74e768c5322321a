use crate::{error_response::handle_proxy_error, listeners::ClientStream, proxy::Proxy, sticky::ClientId};
use futures::{Future, TryFutureExt};
use hyper::{
  server::accept::Accept,
  service::{make_service_fn, Service},
  Body, Request, Response, Server,
};
use log::debug;
use std::{
  error::Error,
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

pub async fn create<I, IE>(acceptor: I, proxy: Arc<Proxy>) -> Result<(), io::Error>
where
  I: Accept<Conn = ClientStream, Error = IE>,
  IE: Into<Box<dyn Error + Send + Sync>>,
{
  let service = make_service_fn(move |stream: &ClientStream| {
    let client = stream.client_id();
    let client_address = stream.remote_addr();
    let proxy = proxy.clone();

    async move {
      debug!("client {} connected from {}", client, client_address);
      Ok::<_, io::Error>(MainService {
        client,
        client_address,
        proxy,
      })
    }
  });
  Server::builder(acceptor)
    .serve(service)
    .map_err(|e| {
      let msg = format!("Failed to listen server: {}", e);
      io::Error::new(io::ErrorKind::Other, msg)
    })
    .await
}

/// Serves every exchange of one client connection
pub struct MainService {
  client: ClientId,
  client_address: SocketAddr,
  proxy: Arc<Proxy>,
}

impl Service<Request<Body>> for MainService {
  type Response = Response<Body>;
  type Error = hyper::Error;

  // let's allow this complex type. A refactor would make it more complicated due to the used trait types
  #[allow(clippy::type_complexity)]
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, request: Request<Body>) -> Self::Future {
    debug!("{:#?} {} {}", request.version(), request.method(), request.uri());

    let proxy = self.proxy.clone();
    let client = self.client;
    let client_address = self.client_address;

    Box::pin(async move {
      match proxy.forward(request, client, client_address).await {
        Ok(response) => Ok(response),
        Err(e) => Ok(handle_proxy_error(e)),
      }
    })
  }
}
