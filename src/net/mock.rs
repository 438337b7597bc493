//! Scripted network for tests.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::client::Network;
use super::types::{FetchError, Request, Response};

/// In-memory network with an online switch and a call log.
///
/// Routes are keyed by `METHOD url`. Unrouted requests get a 404.
pub struct MockNetwork {
  online: AtomicBool,
  latency: Mutex<Option<Duration>>,
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      latency: Mutex::new(None),
      routes: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Delay every answer, so concurrent callers interleave.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  pub fn route(&self, method: Method, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(format!("{} {}", method, url), response);
  }

  pub fn route_get(&self, url: &str, status: StatusCode, body: &str) {
    self.route(Method::GET, url, Response::new(status, body.to_string()));
  }

  /// Every request seen, online or not, as `METHOD url`.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, url: &str) -> usize {
    self
      .calls()
      .iter()
      .filter(|c| c.split_once(' ').map(|(_, u)| u) == Some(url))
      .count()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let key = format!("{} {}", request.method, request.url);
    self.calls.lock().unwrap().push(key.clone());

    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unavailable("offline".to_string()));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "not found")),
    )
  }
}
