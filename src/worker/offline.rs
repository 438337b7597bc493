//! Responses synthesized when neither the network nor the caches can answer.

use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::net::Response;

/// Marker present in the synthesized offline page.
pub const OFFLINE_MARKER: &str = "You are offline";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f5f5f5; color: #333; }
    main { text-align: center; padding: 2rem; }
    button { margin-top: 1rem; padding: 0.6rem 1.4rem; border: 0; border-radius: 4px; background: #1976d2; color: #fff; cursor: pointer; }
  </style>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>Check your internet connection. Pages you visited before may still be available.</p>
    <button onclick="window.location.reload()">Try again</button>
  </main>
</body>
</html>
"#;

/// Terminal fallback for page navigations.
pub fn document() -> Response {
  Response::new(StatusCode::OK, OFFLINE_PAGE).with_content_type("text/html; charset=utf-8")
}

/// Terminal fallback for API calls.
pub fn api() -> Response {
  Response::json(
    StatusCode::SERVICE_UNAVAILABLE,
    &json!({
      "error": "Network unavailable",
      "message": "This request needs a network connection. Please try again when you are back online.",
      "offline": true,
    }),
  )
}

/// Answer for a mutating request that was stored for later replay.
pub fn queued(id: Uuid) -> Response {
  Response::json(
    StatusCode::ACCEPTED,
    &json!({
      "queued": true,
      "id": id,
      "offline": true,
      "message": "You are offline. The change was saved and will be sent when the connection returns.",
    }),
  )
}
