use crate::proxy::ProxyError;
use hyper::{Body, Response, StatusCode};
use log::{debug, warn};

fn with_status(status: StatusCode, message: &'static str) -> Response<Body> {
  let mut response = Response::new(Body::from(message));
  *response.status_mut() = status;
  response
}

pub fn bad_request() -> Response<Body> {
  with_status(StatusCode::BAD_REQUEST, "400 - bad request")
}

pub fn not_found() -> Response<Body> {
  with_status(StatusCode::NOT_FOUND, "404 - page not found")
}

pub fn bad_gateway() -> Response<Body> {
  with_status(StatusCode::BAD_GATEWAY, "502 - bad gateway")
}

pub fn service_unavailable() -> Response<Body> {
  with_status(StatusCode::SERVICE_UNAVAILABLE, "503 - no backend available")
}

pub fn gateway_timeout() -> Response<Body> {
  with_status(StatusCode::GATEWAY_TIMEOUT, "504 - gateway timeout")
}

/// Turns a failed exchange into the response the client gets
pub fn handle_proxy_error(error: ProxyError) -> Response<Body> {
  match error {
    ProxyError::NoRoute => not_found(),
    ProxyError::InvalidUri(e) => {
      debug!("rejecting request: {}", e);
      bad_request()
    }
    ProxyError::BackendUnresolved(_) => {
      debug!("{}", error);
      service_unavailable()
    }
    ProxyError::Timeout => {
      warn!("{}", error);
      gateway_timeout()
    }
    ProxyError::ConnectFailed { .. } | ProxyError::Upstream(_) => {
      warn!("{}", error);
      bad_gateway()
    }
  }
}
