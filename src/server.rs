//! HTTP host: turns incoming requests into worker events and answers with
//! whatever the worker decides.

use axum::{
  body::{Body, Bytes},
  extract::{Request as HttpRequest, State},
  http::{HeaderValue, StatusCode},
  response::{IntoResponse, Response as HttpResponse},
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Report, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::CacheSource;
use crate::config::Config;
use crate::event::{ClientMessage, EventOutcome, WorkerEvent};
use crate::net::{FetchError, Network, Request, Response};
use crate::worker::push::NotificationClick;
use crate::worker::Registration;

/// Response header naming where the body came from.
pub const SOURCE_HEADER: &str = "x-sw-source";

#[derive(Clone)]
pub struct AppState {
  registration: Arc<Registration>,
  network: Arc<dyn Network>,
  scope: Url,
  max_body_bytes: usize,
}

impl AppState {
  pub fn new(registration: Arc<Registration>, scope: Url, max_body_bytes: usize) -> Self {
    Self {
      network: Arc::clone(&registration.context().network),
      registration,
      scope,
      max_body_bytes,
    }
  }
}

pub fn router(state: AppState, control_prefix: &str) -> Router {
  let control = Router::new()
    .route("/status", get(status))
    .route("/message", post(message))
    .route("/update", post(update))
    .route("/sync", post(sync))
    .route("/push", post(push))
    .route("/notification-click", post(notification_click));

  Router::new()
    .nest(control_prefix, control)
    .fallback(intercept)
    .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
  let app = router(state, &config.control_prefix);
  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.listen, e))?;

  info!(listen = %config.listen, upstream = %config.upstream, "gateway listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn intercept(State(state): State<AppState>, request: HttpRequest) -> HttpResponse {
  let request = match to_request(&state, request).await {
    Ok(request) => request,
    Err(status) => return status.into_response(),
  };

  match state
    .registration
    .dispatch(WorkerEvent::Fetch(request.clone()))
    .await
  {
    Ok(EventOutcome::Respond(served)) => {
      // The background refresh, if any, stays detached
      drop(served.refresh);
      to_http(served.response, served.source)
    }
    Ok(_) => match state.network.fetch(&request).await {
      Ok(response) => to_http(response, CacheSource::Network),
      Err(err) => bad_gateway(&request, &err),
    },
    Err(err) => match err.downcast_ref::<FetchError>() {
      Some(fetch_err) => bad_gateway(&request, fetch_err),
      None => internal(err),
    },
  }
}

async fn to_request(state: &AppState, request: HttpRequest) -> Result<Request, StatusCode> {
  let (parts, body) = request.into_parts();

  let path_and_query = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = state
    .scope
    .join(path_and_query)
    .map_err(|_| StatusCode::BAD_REQUEST)?;

  let body = axum::body::to_bytes(body, state.max_body_bytes)
    .await
    .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;

  Ok(Request {
    method: parts.method,
    url,
    headers: parts.headers,
    body,
  })
}

fn to_http(response: Response, source: CacheSource) -> HttpResponse {
  let mut builder = axum::http::Response::builder().status(response.status);
  if let Some(headers) = builder.headers_mut() {
    headers.extend(response.headers);
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  }

  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn bad_gateway(request: &Request, err: &FetchError) -> HttpResponse {
  warn!(method = %request.method, url = %request.url, error = %err, "no response available");
  StatusCode::BAD_GATEWAY.into_response()
}

fn internal(err: Report) -> HttpResponse {
  error!(error = ?err, "event handling failed");
  (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn status(State(state): State<AppState>) -> HttpResponse {
  match state.registration.status() {
    Ok(status) => Json(status).into_response(),
    Err(err) => internal(err),
  }
}

async fn message(State(state): State<AppState>, Json(message): Json<ClientMessage>) -> HttpResponse {
  match state.registration.dispatch(WorkerEvent::Message(message)).await {
    Ok(EventOutcome::Handled) => StatusCode::NO_CONTENT.into_response(),
    Ok(_) => StatusCode::ACCEPTED.into_response(),
    Err(err) => internal(err),
  }
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
  version: String,
}

async fn update(State(state): State<AppState>, Json(body): Json<UpdateBody>) -> HttpResponse {
  let event = WorkerEvent::Install {
    version: body.version,
  };
  if let Err(err) = state.registration.dispatch(event).await {
    return internal(err);
  }
  status(State(state)).await
}

#[derive(Debug, Deserialize)]
struct SyncBody {
  tag: String,
}

async fn sync(State(state): State<AppState>, Json(body): Json<SyncBody>) -> HttpResponse {
  match state
    .registration
    .dispatch(WorkerEvent::Sync { tag: body.tag })
    .await
  {
    Ok(EventOutcome::Deferred(task)) => match task.await {
      Ok(Ok(report)) => Json(report).into_response(),
      Ok(Err(err)) => internal(err),
      Err(err) => internal(eyre!("Background sync task failed: {}", err)),
    },
    Ok(_) => StatusCode::ACCEPTED.into_response(),
    Err(err) => internal(err),
  }
}

async fn push(State(state): State<AppState>, payload: Bytes) -> HttpResponse {
  match state.registration.dispatch(WorkerEvent::Push(payload)).await {
    Ok(EventOutcome::Handled) => StatusCode::NO_CONTENT.into_response(),
    Ok(_) => StatusCode::ACCEPTED.into_response(),
    Err(err) => internal(err),
  }
}

async fn notification_click(
  State(state): State<AppState>,
  Json(click): Json<NotificationClick>,
) -> HttpResponse {
  match state
    .registration
    .dispatch(WorkerEvent::NotificationClick(click))
    .await
  {
    Ok(EventOutcome::OpenWindow(url)) => Json(json!({ "open": url.as_str() })).into_response(),
    Ok(_) => Json(json!({ "open": null })).into_response(),
    Err(err) => internal(err),
  }
}
