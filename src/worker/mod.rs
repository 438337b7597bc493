//! The offline worker: routing, fetch strategies, lifecycle and background
//! work for one release of the application.

mod lifecycle;
pub mod offline;
pub mod push;
pub mod queue;
mod registration;
mod router;
mod strategy;

use color_eyre::Result;
use std::sync::{Arc, RwLock};
use tracing::{debug, info_span, Instrument};
use url::Url;

use crate::cache::{CacheNames, CacheStore};
use crate::config::{QueueConfig, WorkerConfig};
use crate::event::EventOutcome;
use crate::net::{Network, Request};

pub use lifecycle::WorkerState;
pub use registration::Registration;
pub use router::{Route, Router};
pub use strategy::Strategies;

use push::{Notification, NotificationClick, Notifier};
use queue::{ActionQueue, SYNC_TAG};

/// Everything a worker needs, built once at startup and shared by every
/// version of the worker.
pub struct WorkerContext {
  pub store: CacheStore,
  pub network: Arc<dyn Network>,
  pub queue: Arc<dyn ActionQueue>,
  pub notifier: Arc<dyn Notifier>,
  pub config: WorkerConfig,
  pub queue_config: QueueConfig,
  /// Base URL precache paths and notification targets resolve against
  pub scope: Url,
  /// Held while the offline queue is being replayed
  pub replay_lock: tokio::sync::Mutex<()>,
}

/// One version of the worker.
pub struct Worker {
  ctx: Arc<WorkerContext>,
  names: CacheNames,
  router: Router,
  strategies: Strategies,
  state: Arc<RwLock<WorkerState>>,
}

impl Worker {
  pub fn new(ctx: Arc<WorkerContext>, version: &str) -> Self {
    let names = CacheNames::new(ctx.config.cache_prefix.clone(), version);
    let state = Arc::new(RwLock::new(WorkerState::Parsed));
    Self {
      router: Router::new(&ctx.config),
      strategies: Strategies::new(Arc::clone(&ctx), names.clone(), Arc::clone(&state)),
      names,
      ctx,
      state,
    }
  }

  pub fn version(&self) -> &str {
    self.names.version()
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  /// Route an intercepted request to exactly one strategy.
  ///
  /// Network failures that a strategy can't cover are returned as
  /// [`crate::net::FetchError`] inside the report.
  pub async fn handle_fetch(&self, request: Request) -> Result<EventOutcome> {
    let route = self.router.classify(&request);
    let span = info_span!("fetch", method = %request.method, url = %request.url, ?route);
    self.respond(route, &request).instrument(span).await
  }

  async fn respond(&self, route: Route, request: &Request) -> Result<EventOutcome> {
    let served = match route {
      Route::Ignore => return Ok(EventOutcome::Ignore),
      Route::Document => self.strategies.document(request).await,
      Route::Api => self.strategies.api(request).await,
      Route::StaticAsset => self.strategies.static_asset(request).await?,
      Route::Fallback => self.strategies.fallback(request).await?,
      Route::Mutation => self.strategies.mutation(request).await?,
    };
    debug!(source = served.source.as_str(), status = %served.response.status, "served");
    Ok(EventOutcome::Respond(served))
  }

  pub fn handle_push(&self, payload: &[u8]) -> EventOutcome {
    let notification = Notification::from_push(payload);
    self.ctx.notifier.show(&notification);
    EventOutcome::Handled
  }

  pub fn handle_notification_click(&self, click: &NotificationClick) -> EventOutcome {
    match click.target(&self.ctx.scope) {
      Some(url) => EventOutcome::OpenWindow(url),
      None => EventOutcome::Handled,
    }
  }

  /// Start replaying the offline queue. The replay runs as its own task; the
  /// host decides whether to wait for it. Overlapping syncs run one after the
  /// other so an action is never sent twice.
  pub fn handle_sync(&self, tag: &str) -> EventOutcome {
    if tag != SYNC_TAG {
      debug!(tag, "ignoring unknown sync tag");
      return EventOutcome::Ignore;
    }

    let ctx = Arc::clone(&self.ctx);
    EventOutcome::Deferred(tokio::spawn(
      async move {
        let _replaying = ctx.replay_lock.lock().await;
        queue::replay(
          ctx.queue.as_ref(),
          ctx.network.as_ref(),
          ctx.queue_config.max_attempts,
        )
        .await
      }
      .instrument(info_span!("background_sync")),
    ))
  }
}

#[cfg(test)]
pub(crate) use tests::{test_context, test_context_with, RecordingNotifier};

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::net::mock::MockNetwork;
  use crate::net::FetchError;
  use queue::{MemoryQueue, PendingAction};
  use reqwest::{Method, StatusCode};
  use std::sync::Mutex;

  /// Notifier that remembers what it showed.
  #[derive(Default)]
  pub struct RecordingNotifier {
    pub shown: Mutex<Vec<Notification>>,
  }

  impl Notifier for RecordingNotifier {
    fn show(&self, notification: &Notification) {
      self.shown.lock().unwrap().push(notification.clone());
    }
  }

  pub fn test_context_with(
    network: Arc<MockNetwork>,
    config: WorkerConfig,
    notifier: Arc<dyn Notifier>,
  ) -> Arc<WorkerContext> {
    Arc::new(WorkerContext {
      store: CacheStore::new(Arc::new(MemoryStorage::new())),
      network,
      queue: Arc::new(MemoryQueue::new()),
      notifier,
      config,
      queue_config: QueueConfig::default(),
      scope: Url::parse("http://localhost:8080/").unwrap(),
      replay_lock: tokio::sync::Mutex::new(()),
    })
  }

  pub fn test_context(network: Arc<MockNetwork>) -> Arc<WorkerContext> {
    let config = WorkerConfig {
      cache_prefix: "app".to_string(),
      ..WorkerConfig::default()
    };
    test_context_with(network, config, Arc::new(RecordingNotifier::default()))
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8080/").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_fetch_ignores_extension_scheme() {
    let network = Arc::new(MockNetwork::new());
    let worker = Worker::new(test_context(network.clone()), "1.0.0");

    let request = Request::get(Url::parse("chrome-extension://abc/inject.js").unwrap());
    let outcome = worker.handle_fetch(request).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Ignore));
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_static_failure_carries_fetch_error() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let worker = Worker::new(test_context(network), "1.0.0");

    let err = worker
      .handle_fetch(Request::get(url("/static/js/bundle.js")))
      .await
      .unwrap_err();
    assert!(err.downcast_ref::<FetchError>().is_some());
  }

  #[tokio::test]
  async fn test_fetch_api_round_trip() {
    let network = Arc::new(MockNetwork::new());
    network.route_get(
      url("/api/v1/properties?page=1").as_str(),
      StatusCode::OK,
      r#"[{"id":1}]"#,
    );
    let worker = Worker::new(test_context(network.clone()), "1.0.0");

    let request = Request::get(url("/api/v1/properties?page=1"));
    let EventOutcome::Respond(online) = worker.handle_fetch(request.clone()).await.unwrap() else {
      panic!("expected a response");
    };

    network.set_online(false);
    let EventOutcome::Respond(offline) = worker.handle_fetch(request).await.unwrap() else {
      panic!("expected a response");
    };
    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.response.body, online.response.body);
    assert_eq!(offline.response.status, StatusCode::OK);
  }

  #[tokio::test]
  async fn test_push_shows_notification() {
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = test_context_with(
      Arc::new(MockNetwork::new()),
      WorkerConfig::default(),
      notifier.clone(),
    );
    let worker = Worker::new(ctx, "1.0.0");

    let outcome = worker.handle_push(br#"{"title":"New renter","body":"Room 12"}"#);
    assert!(matches!(outcome, EventOutcome::Handled));
    let shown = notifier.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "New renter");
  }

  #[tokio::test]
  async fn test_notification_click_opens_window() {
    let worker = Worker::new(test_context(Arc::new(MockNetwork::new())), "1.0.0");
    let click = NotificationClick {
      action: Some("view".to_string()),
      data: Some(serde_json::json!({ "url": "/contracts/9" })),
    };
    match worker.handle_notification_click(&click) {
      EventOutcome::OpenWindow(target) => assert_eq!(target, url("/contracts/9")),
      _ => panic!("expected a window to open"),
    }
  }

  #[tokio::test]
  async fn test_sync_replays_queue() {
    let network = Arc::new(MockNetwork::new());
    network.route(
      Method::POST,
      url("/api/v1/services").as_str(),
      crate::net::Response::new(StatusCode::OK, "{}"),
    );
    let ctx = test_context(network);
    ctx
      .queue
      .enqueue(&PendingAction::record(&Request::new(
        Method::POST,
        url("/api/v1/services"),
      )))
      .unwrap();
    let worker = Worker::new(ctx.clone(), "1.0.0");

    assert!(matches!(worker.handle_sync("other-tag"), EventOutcome::Ignore));

    let EventOutcome::Deferred(task) = worker.handle_sync(SYNC_TAG) else {
      panic!("expected a deferred replay");
    };
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(ctx.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_overlapping_syncs_send_each_action_once() {
    let network = Arc::new(MockNetwork::new());
    network.set_latency(std::time::Duration::from_millis(20));
    network.route(
      Method::POST,
      url("/api/v1/contracts").as_str(),
      crate::net::Response::new(StatusCode::CREATED, "{}"),
    );
    let ctx = test_context(network.clone());
    ctx
      .queue
      .enqueue(&PendingAction::record(&Request::new(
        Method::POST,
        url("/api/v1/contracts"),
      )))
      .unwrap();
    let worker = Worker::new(ctx.clone(), "1.0.0");

    let (EventOutcome::Deferred(first), EventOutcome::Deferred(second)) =
      (worker.handle_sync(SYNC_TAG), worker.handle_sync(SYNC_TAG))
    else {
      panic!("expected deferred replays");
    };
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap().unwrap(), second.unwrap().unwrap());

    assert_eq!(first.replayed + second.replayed, 1);
    assert_eq!(network.call_count(url("/api/v1/contracts").as_str()), 1);
    assert_eq!(ctx.queue.len().unwrap(), 0);
  }
}
