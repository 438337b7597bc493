use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use url::Url;

/// Header carrying the id of the page that issued a request.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// What the page is going to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Full page navigation
  Document,
  /// Anything else (script, image, fetch/XHR, ...)
  Subresource,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation to `url`, as a browser would send it.
  pub fn navigate(url: Url) -> Self {
    let mut request = Self::get(url);
    request
      .headers
      .insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    request
      .headers
      .insert("sec-fetch-dest", HeaderValue::from_static("document"));
    request
  }

  pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.insert(HeaderName::from_static(name), value);
    }
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// Classify the request by fetch metadata, falling back to the Accept header
  /// for clients that don't send Sec-Fetch-* headers.
  pub fn destination(&self) -> Destination {
    let header = |name: &str| {
      self
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase)
    };

    if header("sec-fetch-mode").as_deref() == Some("navigate")
      || header("sec-fetch-dest").as_deref() == Some("document")
    {
      return Destination::Document;
    }

    if header("sec-fetch-dest").is_none() {
      let prefers_html = self
        .headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .and_then(|accept| accept.split(',').next())
        .is_some_and(|first| first.trim().starts_with("text/html"));
      if prefers_html {
        return Destination::Document;
      }
    }

    Destination::Subresource
  }

  /// Cache identity: the URL without its fragment. Headers never take part.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }

  pub fn client_id(&self) -> Option<&str> {
    self
      .headers
      .get(CLIENT_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .filter(|id| !id.is_empty())
  }
}

/// A fully buffered response.
///
/// The body is reference counted, so cloning a response before storing it
/// leaves the original intact for the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  pub fn with_content_type(mut self, content_type: &'static str) -> Self {
    self
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    self
  }

  pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_content_type("application/json")
  }

  /// Status is in the 2xx range.
  pub fn ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }
}

/// Failure to get any response from the network.
///
/// HTTP error statuses are responses, not failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("network unavailable: {0}")]
  Unavailable(String),
  #[error("request timed out")]
  Timeout,
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      FetchError::Timeout
    } else if err.is_builder() {
      FetchError::Invalid(err.to_string())
    } else {
      FetchError::Unavailable(err.to_string())
    }
  }
}
