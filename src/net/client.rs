use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;

use super::types::{FetchError, Request, Response, CLIENT_ID_HEADER};

/// Something that can answer a request over the network.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

/// Network client that forwards intercepted requests to the upstream origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  upstream: Url,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      upstream: config.upstream.clone(),
    })
  }

  /// Same path and query, upstream scheme/host/port.
  fn upstream_url(&self, url: &Url) -> Url {
    let mut target = self.upstream.clone();
    target.set_path(url.path());
    target.set_query(url.query());
    target
  }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
  let mut out = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if is_hop_by_hop(name) || name.as_str() == CLIENT_ID_HEADER {
      continue;
    }
    out.append(name.clone(), value.clone());
  }
  out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
  HOP_BY_HOP.contains(&name.as_str())
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let target = self.upstream_url(&request.url);
    debug!(method = %request.method, url = %target, "forwarding to upstream");

    let response = self
      .client
      .request(request.method.clone(), target)
      .headers(forwardable(&request.headers))
      .body(request.body.clone())
      .send()
      .await?;

    let status = response.status();
    let headers = forwardable(response.headers());
    let body = response.bytes().await?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  fn network() -> HttpNetwork {
    let config = Config::parse("upstream: http://backend.internal:3000/app\n").unwrap();
    HttpNetwork::new(&config).unwrap()
  }

  #[test]
  fn test_upstream_url_keeps_path_and_query() {
    let url = Url::parse("http://localhost:8080/api/v1/rooms?page=2").unwrap();
    let target = network().upstream_url(&url);
    assert_eq!(
      target.as_str(),
      "http://backend.internal:3000/api/v1/rooms?page=2"
    );
  }

  #[test]
  fn test_hop_by_hop_headers_are_dropped() {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("localhost:8080"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("tab-1"));
    headers.insert("accept", HeaderValue::from_static("application/json"));

    let out = forwardable(&headers);
    assert_eq!(out.len(), 1);
    assert!(out.contains_key("accept"));
  }
}
