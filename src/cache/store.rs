//! Cache store: versioned cache names over a storage backend.

use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info};

use crate::net::{Request, Response};

use super::traits::{CacheStorage, CachedResponse};

/// Names of the caches belonging to one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  prefix: String,
  version: String,
}

impl CacheNames {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn static_cache(&self) -> String {
    format!("{}-static-v{}", self.prefix, self.version)
  }

  pub fn dynamic_cache(&self) -> String {
    format!("{}-dynamic-v{}", self.prefix, self.version)
  }

  /// The cache belongs to this application, whatever its version.
  pub fn owns(&self, cache: &str) -> bool {
    cache
      .strip_prefix(self.prefix.as_str())
      .is_some_and(|rest| rest.starts_with('-'))
  }
}

/// Cache store shared by every request handler and the lifecycle manager.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self { storage }
  }

  pub fn open(&self, cache: &str) -> Result<()> {
    self.storage.open(cache)
  }

  /// Store a copy of `response` under the request's identity.
  ///
  /// Only GET requests are ever stored; anything else is ignored.
  pub fn put(&self, cache: &str, request: &Request, response: &Response) -> Result<()> {
    if request.method != Method::GET {
      debug!(method = %request.method, url = %request.url, "refusing to cache non-GET request");
      return Ok(());
    }

    let entry = CachedResponse::capture(request.cache_key(), response);
    self.storage.put(cache, &entry)
  }

  /// Look up `request` across all caches.
  pub fn lookup(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::GET {
      return Ok(None);
    }

    let hit = self.storage.match_any(&request.cache_key())?;
    if let Some((cache, _)) = &hit {
      debug!(cache = %cache, url = %request.url, "cache hit");
    }
    Ok(hit.map(|(_, entry)| entry))
  }

  /// Look up `request` in a single cache.
  pub fn lookup_in(&self, cache: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if request.method != Method::GET {
      return Ok(None);
    }
    self.storage.get(cache, &request.cache_key())
  }

  /// All cache names, in creation order.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }

  pub fn delete(&self, cache: &str) -> Result<bool> {
    self.storage.delete(cache)
  }

  /// Delete every cache owned by the application that isn't current.
  ///
  /// Caches outside the application's prefix are left alone.
  pub fn delete_stale(&self, names: &CacheNames) -> Result<Vec<String>> {
    let current = [names.static_cache(), names.dynamic_cache()];
    let mut deleted = Vec::new();

    for cache in self.storage.cache_names()? {
      if names.owns(&cache) && !current.contains(&cache) {
        info!(cache = %cache, "deleting stale cache");
        if self.storage.delete(&cache)? {
          deleted.push(cache);
        }
      }
    }

    Ok(deleted)
  }
}
