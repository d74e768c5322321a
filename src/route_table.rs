use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
  #[error("invalid PREFIX=ROUTE mapping specified: {0}")]
  MalformedMapping(String),
  #[error("path prefix {0} is mapped more than once")]
  DuplicatePrefix(String),
  #[error("default route name must not be empty")]
  EmptyDefaultRoute,
}

/// A single `PREFIX=ROUTE` entry as given on the command line or in the configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMapping {
  pub prefix: String,
  pub route: String,
}

impl FromStr for RouteMapping {
  type Err = RouteError;

  fn from_str(mapping: &str) -> Result<Self, Self::Err> {
    match mapping.split_once('=') {
      Some((prefix, route)) if !prefix.is_empty() && !route.is_empty() => Ok(RouteMapping {
        prefix: prefix.to_string(),
        route: route.to_string(),
      }),
      _ => Err(RouteError::MalformedMapping(mapping.to_string())),
    }
  }
}

/// A path prefix bound to the logical name of a backend service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
  prefix: String,
  name: String,
}

impl Route {
  pub fn new<P: Into<String>, N: Into<String>>(prefix: P, name: N) -> Route {
    Route {
      prefix: prefix.into(),
      name: name.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Strips the matched prefix from `path_and_query`, keeping exactly one leading `/` and the query string.
  pub fn rewrite(&self, path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
      Some((path, query)) => (path, Some(query)),
      None => (path_and_query, None),
    };

    let stripped = match path.strip_prefix(self.prefix.as_str()) {
      Some(rest) if rest.starts_with('/') => rest.to_string(),
      Some(rest) => format!("/{}", rest),
      None => path.to_string(),
    };

    match query {
      Some(query) => format!("{}?{}", stripped, query),
      None => stripped,
    }
  }
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} -> {}", self.prefix, self.name)
  }
}

/// Maps request paths onto routes. Built once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct RouteTable {
  routes: HashMap<String, Arc<Route>>,
  default_route: Option<Arc<Route>>,
}

impl RouteTable {
  pub fn new<I>(mappings: I, default_route: Option<String>) -> Result<RouteTable, RouteError>
  where
    I: IntoIterator<Item = RouteMapping>,
  {
    let mut routes = HashMap::new();
    for mapping in mappings {
      if mapping.prefix.is_empty() || mapping.route.is_empty() {
        return Err(RouteError::MalformedMapping(format!("{}={}", mapping.prefix, mapping.route)));
      }
      if routes.contains_key(&mapping.prefix) {
        return Err(RouteError::DuplicatePrefix(mapping.prefix));
      }
      let route = Arc::new(Route::new(mapping.prefix.clone(), mapping.route));
      routes.insert(mapping.prefix, route);
    }

    let default_route = match default_route {
      Some(name) if name.is_empty() => return Err(RouteError::EmptyDefaultRoute),
      Some(name) => Some(Arc::new(Route::new("", name))),
      None => None,
    };

    Ok(RouteTable { routes, default_route })
  }

  /// Returns the route with the longest prefix matching `path` on a segment boundary, else the default route.
  ///
  /// A prefix matches when it ends with `/`, or when the path continues with `/` or ends right after it.
  /// So `/svc` matches `/svc` and `/svc/a`, but never `/svcx`.
  pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
    let bytes = path.as_bytes();
    for cut in (1..=bytes.len()).rev() {
      let on_boundary = bytes[cut - 1] == b'/' || cut == bytes.len() || bytes[cut] == b'/';
      if !on_boundary {
        continue;
      }
      if let Some(route) = self.routes.get(&path[..cut]) {
        return Some(route.clone());
      }
    }

    self.default_route.clone()
  }

  pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
    self.routes.values()
  }

  pub fn len(&self) -> usize {
    self.routes.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mapping(prefix: &str, route: &str) -> RouteMapping {
    RouteMapping {
      prefix: prefix.into(),
      route: route.into(),
    }
  }

  fn table(mappings: &[(&str, &str)], default_route: Option<&str>) -> RouteTable {
    RouteTable::new(
      mappings.iter().map(|(prefix, route)| mapping(prefix, route)),
      default_route.map(String::from),
    )
    .unwrap()
  }

  #[test]
  fn parse_mapping() {
    assert_eq!("/api/=orders".parse(), Ok(mapping("/api/", "orders")));
    assert_eq!("/api/=orders=x".parse(), Ok(mapping("/api/", "orders=x")));
  }

  #[test]
  fn parse_malformed_mappings() {
    for input in ["/api/", "=orders", "/api/=", "="] {
      assert_eq!(
        input.parse::<RouteMapping>(),
        Err(RouteError::MalformedMapping(input.into())),
        "{}",
        input
      );
    }
  }

  #[test]
  fn duplicate_prefix_is_rejected() {
    let result = RouteTable::new(vec![mapping("/a/", "a"), mapping("/a/", "b")], None);

    assert_eq!(result.unwrap_err(), RouteError::DuplicatePrefix("/a/".into()));
  }

  #[test]
  fn empty_prefix_is_rejected() {
    let result = RouteTable::new(vec![mapping("", "a")], None);

    assert!(matches!(result, Err(RouteError::MalformedMapping(_))));
  }

  #[test]
  fn resolve_longest_prefix() {
    let table = table(&[("/api/", "A"), ("/api/v2/", "B")], None);

    assert_eq!(table.resolve("/api/v2/x").unwrap().name(), "B");
    assert_eq!(table.resolve("/api/x").unwrap().name(), "A");
    assert_eq!(table.resolve("/api/v2/").unwrap().name(), "B");
    assert_eq!(table.resolve("/api/v2").unwrap().name(), "A");
  }

  #[test]
  fn resolve_respects_segment_boundaries() {
    let table = table(&[("/svc", "svc")], None);

    assert_eq!(table.resolve("/svc").unwrap().name(), "svc");
    assert_eq!(table.resolve("/svc/a").unwrap().name(), "svc");
    assert_eq!(table.resolve("/svcx"), None);
    assert_eq!(table.resolve("/sv"), None);
  }

  #[test]
  fn resolve_falls_back_to_default_route() {
    let table = table(&[("/api/", "A")], Some("fallback"));

    assert_eq!(table.resolve("/other").unwrap().name(), "fallback");
    assert_eq!(table.resolve("").unwrap().name(), "fallback");
    assert_eq!(table.resolve("/api/x").unwrap().name(), "A");
  }

  #[test]
  fn resolve_handles_multibyte_paths() {
    let table = table(&[("/ä/", "umlaut")], None);

    assert_eq!(table.resolve("/ä/ö").unwrap().name(), "umlaut");
    assert_eq!(table.resolve("/äö"), None);
  }

  #[test]
  fn rewrite_with_trailing_slash_prefix() {
    let route = Route::new("/svc/", "svc");

    assert_eq!(route.rewrite("/svc/a/b"), "/a/b");
    assert_eq!(route.rewrite("/svc/"), "/");
    assert_eq!(route.rewrite("/svc/a?x=1"), "/a?x=1");
  }

  #[test]
  fn rewrite_without_trailing_slash_prefix() {
    let route = Route::new("/svc", "svc");

    assert_eq!(route.rewrite("/svc/a/b"), "/a/b");
    assert_eq!(route.rewrite("/svc"), "/");
    assert_eq!(route.rewrite("/svc?x=1"), "/?x=1");
  }

  #[test]
  fn rewrite_default_route_keeps_path() {
    let route = Route::new("", "fallback");

    assert_eq!(route.rewrite("/a/b?c"), "/a/b?c");
  }
}
