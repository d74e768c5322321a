use crate::{
  discovery::{
    dns::DnsDirectory,
    file::{FileDirectory, ServicesFileError},
    BackendDirectory,
  },
  load_balancing::{freshest::Freshest, random_start::RandomStart, CandidateOrder},
  pool::PoolConfig,
  proxy::ProxyTimeouts,
  route_table::{RouteError, RouteMapping, RouteTable},
};
use clap::{ArgEnum, Parser};
use log::{debug, info};
use serde::Deserialize;
use std::{
  collections::HashMap,
  fs,
  io,
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use thiserror::Error;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read configuration file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("failed to parse configuration file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error(transparent)]
  Route(#[from] RouteError),
  #[error("invalid listen address {0}")]
  ListenAddress(String),
  #[error("{0}")]
  Limits(String),
  #[error("file discovery needs --discovery-file or --config")]
  MissingServicesFile,
  #[error(transparent)]
  Discovery(#[from] ServicesFileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
  /// Start at a random candidate and go round from there
  Random,
  /// Prefer the candidates most recently seen by discovery
  Freshest,
}

impl Selection {
  pub fn order(self) -> Box<dyn CandidateOrder> {
    match self {
      Selection::Random => Box::new(RandomStart::new()),
      Selection::Freshest => Box::new(Freshest::new()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
  /// Route names are host:port and get resolved through DNS
  Dns,
  /// Route members are listed in the [services] table of a TOML file
  File,
}

/// Reverse proxy which forwards requests to dynamically discovered backends
#[derive(Debug, Default, Parser)]
#[clap(version, about)]
pub struct CommandLine {
  /// TOML file with settings, routes and optionally services
  #[clap(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// Route requests starting with PREFIX to ROUTE, may be repeated
  #[clap(long = "map", value_name = "PREFIX=ROUTE")]
  pub mappings: Vec<RouteMapping>,
  /// Route for requests no prefix matches
  #[clap(long)]
  pub default_route: Option<String>,
  #[clap(long, value_name = "ADDRESS")]
  pub listen: Option<String>,
  /// Hard limit of open connections per backend
  #[clap(long)]
  pub max_connections: Option<usize>,
  /// Open connections per backend above which idle ones are closed
  #[clap(long)]
  pub soft_max_connections: Option<usize>,
  /// Requests allowed to wait once a backend is at its connection limit
  #[clap(long)]
  pub max_queue_size: Option<usize>,
  /// Idle connections kept per backend
  #[clap(long)]
  pub max_cached_connections: Option<usize>,
  /// Idle connection time to live in milliseconds, negative to keep them forever
  #[clap(long, allow_hyphen_values = true)]
  pub ttl: Option<i64>,
  /// Milliseconds a backend is avoided after a failed connect
  #[clap(long)]
  pub problem_server_retry: Option<u64>,
  /// Milliseconds an exchange may take until the response headers arrive
  #[clap(long)]
  pub max_request_time: Option<u64>,
  /// Milliseconds to wait for discovery, defaults to the maximum request time
  #[clap(long)]
  pub directory_timeout: Option<u64>,
  #[clap(long, arg_enum)]
  pub selection: Option<Selection>,
  #[clap(long, arg_enum)]
  pub discovery: Option<DiscoveryKind>,
  #[clap(long, value_name = "FILE")]
  pub discovery_file: Option<PathBuf>,
  /// Talk HTTP/2 with prior knowledge to backends
  #[clap(long)]
  pub backend_http2: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
  listen: Option<String>,
  default_route: Option<String>,
  max_connections: Option<usize>,
  soft_max_connections: Option<usize>,
  max_queue_size: Option<usize>,
  max_cached_connections: Option<usize>,
  ttl: Option<i64>,
  problem_server_retry: Option<u64>,
  max_request_time: Option<u64>,
  directory_timeout: Option<u64>,
  selection: Option<Selection>,
  discovery: Option<DiscoveryKind>,
  discovery_file: Option<PathBuf>,
  backend_http2: Option<bool>,
  routes: HashMap<String, String>,
}

impl FileConfig {
  fn new(path: &Path) -> Result<FileConfig, ConfigError> {
    let toml_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config = toml::from_str(&toml_str).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    info!("Successfully parsed configuration file {}", path.display());
    Ok(config)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
  Dns,
  File(PathBuf),
}

/// Everything the proxy needs to start, with command line values taking precedence over the configuration file
#[derive(Debug)]
pub struct Settings {
  pub listen: SocketAddr,
  pub routes: RouteTable,
  pub pool: PoolConfig,
  pub timeouts: ProxyTimeouts,
  pub selection: Selection,
  pub discovery: Discovery,
  pub backend_http2: bool,
}

impl Settings {
  pub fn load(command_line: CommandLine) -> Result<Settings, ConfigError> {
    let file = match &command_line.config {
      Some(path) => FileConfig::new(path)?,
      None => FileConfig::default(),
    };

    let listen = command_line
      .listen
      .or(file.listen)
      .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());
    let listen = listen.parse::<SocketAddr>().map_err(|_| ConfigError::ListenAddress(listen))?;

    let defaults = PoolConfig::default();
    let pool = PoolConfig {
      problem_server_retry: command_line
        .problem_server_retry
        .or(file.problem_server_retry)
        .map_or(defaults.problem_server_retry, Duration::from_millis),
      max_connections: command_line
        .max_connections
        .or(file.max_connections)
        .unwrap_or(defaults.max_connections),
      soft_max_connections: command_line
        .soft_max_connections
        .or(file.soft_max_connections)
        .unwrap_or(defaults.soft_max_connections),
      max_cached_connections: command_line
        .max_cached_connections
        .or(file.max_cached_connections)
        .unwrap_or(defaults.max_cached_connections),
      max_queue_size: command_line
        .max_queue_size
        .or(file.max_queue_size)
        .unwrap_or(defaults.max_queue_size),
      connection_ttl: match command_line.ttl.or(file.ttl) {
        Some(ttl) if ttl < 0 => None,
        Some(ttl) => Some(Duration::from_millis(ttl.unsigned_abs())),
        None => defaults.connection_ttl,
      },
    };
    check_limits(&pool)?;

    let max_request_time = command_line
      .max_request_time
      .or(file.max_request_time)
      .map_or(ProxyTimeouts::default().max_request_time, Duration::from_millis);
    let timeouts = ProxyTimeouts {
      max_request_time,
      directory: command_line
        .directory_timeout
        .or(file.directory_timeout)
        .map_or(max_request_time, Duration::from_millis),
    };

    let mut mappings: Vec<RouteMapping> = file
      .routes
      .into_iter()
      .filter(|(prefix, _)| !command_line.mappings.iter().any(|mapping| &mapping.prefix == prefix))
      .map(|(prefix, route)| RouteMapping { prefix, route })
      .collect();
    mappings.extend(command_line.mappings);
    let routes = RouteTable::new(mappings, command_line.default_route.or(file.default_route))?;
    for route in routes.routes() {
      debug!("route {}", route);
    }

    let discovery = match command_line.discovery.or(file.discovery).unwrap_or(DiscoveryKind::Dns) {
      DiscoveryKind::Dns => Discovery::Dns,
      DiscoveryKind::File => Discovery::File(
        command_line
          .discovery_file
          .or(file.discovery_file)
          .or(command_line.config)
          .ok_or(ConfigError::MissingServicesFile)?,
      ),
    };

    Ok(Settings {
      listen,
      routes,
      pool,
      timeouts,
      selection: command_line.selection.or(file.selection).unwrap_or(Selection::Random),
      discovery,
      backend_http2: command_line.backend_http2 || file.backend_http2.unwrap_or(false),
    })
  }

  pub fn directory(&self) -> Result<Arc<dyn BackendDirectory>, ConfigError> {
    match &self.discovery {
      Discovery::Dns => Ok(Arc::new(DnsDirectory::new())),
      Discovery::File(path) => Ok(Arc::new(FileDirectory::watch(path)?)),
    }
  }
}

fn check_limits(pool: &PoolConfig) -> Result<(), ConfigError> {
  if pool.max_connections == 0 {
    return Err(ConfigError::Limits("max connections must be greater than zero".into()));
  }
  if pool.soft_max_connections > pool.max_connections {
    return Err(ConfigError::Limits(format!(
      "soft max connections ({}) must not exceed max connections ({})",
      pool.soft_max_connections, pool.max_connections
    )));
  }
  Ok(())
}
