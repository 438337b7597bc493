//! Core traits and types for the caching system.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tokio::task::JoinHandle;

use crate::net::Response;

/// A response as it sits in a named cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  /// Request identity the response was stored under
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Capture a copy of `response` for storage under `url`.
  pub fn capture(url: String, response: &Response) -> Self {
    Self {
      url,
      status: response.status.as_u16(),
      headers: response
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
        .collect(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Rebuild a response. Headers that no longer parse are dropped.
  pub fn to_response(&self) -> Response {
    let mut headers = HeaderMap::with_capacity(self.headers.len());
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    Response {
      status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
      headers,
      body: self.body.clone(),
    }
  }
}

/// Trait for cache storage backends.
///
/// Implementations must be safe to share between concurrent request handlers.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it doesn't exist.
  fn open(&self, cache: &str) -> Result<()>;

  /// Store `entry` under its url, replacing any previous entry. Opens the cache
  /// on first use.
  fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()>;

  /// Look up a single cache.
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Names of all caches in creation order.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and everything in it. Returns whether it existed.
  fn delete(&self, cache: &str) -> Result<bool>;

  /// First hit for `key` across all caches, in creation order.
  fn match_any(&self, key: &str) -> Result<Option<(String, CachedResponse)>> {
    for name in self.cache_names()? {
      if let Some(entry) = self.get(&name, key)? {
        return Ok(Some((name, entry)));
      }
    }
    Ok(None)
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Stored response from a named cache
  Cache,
  /// The cached offline page, served in place of a document
  OfflinePage,
  /// Synthesized offline response, nothing was reachable
  Offline,
  /// A mutating request was queued for replay
  Queued,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::OfflinePage => "offline-page",
      Self::Offline => "offline",
      Self::Queued => "queued",
    }
  }
}

/// Response produced by a strategy, including metadata about the source.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
  /// Detached background refresh started on behalf of this response
  pub refresh: Option<JoinHandle<()>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      stored_at: None,
      refresh: None,
    }
  }

  pub fn from_cache(entry: &CachedResponse) -> Self {
    Self {
      response: entry.to_response(),
      source: CacheSource::Cache,
      stored_at: Some(entry.stored_at),
      refresh: None,
    }
  }

  pub fn synthesized(response: Response, source: CacheSource) -> Self {
    Self {
      response,
      source,
      stored_at: None,
      refresh: None,
    }
  }

  pub fn with_refresh(mut self, refresh: JoinHandle<()>) -> Self {
    self.refresh = Some(refresh);
    self
  }
}
