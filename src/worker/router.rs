use reqwest::Method;
use std::collections::BTreeSet;

use crate::config::WorkerConfig;
use crate::net::{Destination, Request};

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Non-GET: straight to the network, never cached
  Mutation,
  /// Extension scheme: not intercepted at all
  Ignore,
  /// Page navigation: network first
  Document,
  /// Under the API prefix
  Api,
  /// Script, stylesheet, image, font: cache first
  StaticAsset,
  /// Anything else: network, cache as backup
  Fallback,
}

/// Classifies requests in fixed priority order; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct Router {
  api_prefix: String,
  static_prefixes: Vec<String>,
  static_extensions: BTreeSet<String>,
  ignored_schemes: BTreeSet<String>,
}

impl Router {
  pub fn new(config: &WorkerConfig) -> Self {
    Self {
      api_prefix: config.api_prefix.clone(),
      static_prefixes: config.static_prefixes.clone(),
      static_extensions: config.static_extensions.clone(),
      ignored_schemes: config.ignored_schemes.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Mutation;
    }
    if self.ignored_schemes.contains(request.url.scheme()) {
      return Route::Ignore;
    }
    if request.destination() == Destination::Document {
      return Route::Document;
    }

    let path = request.url.path();
    if path.starts_with(&self.api_prefix) {
      return Route::Api;
    }
    if self.is_static_asset(path) {
      return Route::StaticAsset;
    }
    Route::Fallback
  }

  fn is_static_asset(&self, path: &str) -> bool {
    if self.static_prefixes.iter().any(|p| path.starts_with(p)) {
      return true;
    }

    let file_name = path.rsplit('/').next().unwrap_or_default();
    file_name
      .rsplit_once('.')
      .is_some_and(|(_, ext)| self.static_extensions.contains(&ext.to_ascii_lowercase()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn router() -> Router {
    Router::new(&WorkerConfig::default())
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_is_mutation() {
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
      let req = Request::new(method, Url::parse("http://localhost/api/v1/rooms").unwrap());
      assert_eq!(router().classify(&req), Route::Mutation);
    }
  }

  #[test]
  fn test_extension_scheme_is_ignored() {
    let req = get("chrome-extension://abcdef/script.js");
    assert_eq!(router().classify(&req), Route::Ignore);
  }

  #[test]
  fn test_navigation_beats_api_prefix() {
    let req = Request::navigate(Url::parse("http://localhost/api/v1/rooms").unwrap());
    assert_eq!(router().classify(&req), Route::Document);
  }

  #[test]
  fn test_api_beats_static_extension() {
    assert_eq!(
      router().classify(&get("http://localhost/api/v1/export.css")),
      Route::Api
    );
  }

  #[test]
  fn test_static_assets() {
    let router = router();
    for url in [
      "http://localhost/static/js/bundle.js",
      "http://localhost/icons/icon-192x192.png",
      "http://localhost/logo.SVG",
      "http://localhost/fonts/inter.woff2",
      "http://localhost/static/media/README",
    ] {
      assert_eq!(router.classify(&get(url)), Route::StaticAsset, "{}", url);
    }
  }

  #[test]
  fn test_everything_else_falls_back() {
    let router = router();
    for url in [
      "http://localhost/manifest.json",
      "http://localhost/rooms",
      "http://localhost/archive.js.map",
    ] {
      assert_eq!(router.classify(&get(url)), Route::Fallback, "{}", url);
    }
  }
}
