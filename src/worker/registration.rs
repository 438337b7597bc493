//! Registration: which worker version is active, which is waiting, and which
//! pages are controlled. Every event enters through [`Registration::dispatch`].

use color_eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::event::{ClientMessage, EventOutcome, WorkerEvent};
use crate::net::{Destination, Request};

use super::{Worker, WorkerContext, WorkerState};

/// Clients remembered at most; the least recently seen is forgotten first.
pub const MAX_CLIENTS: usize = 1024;

struct ClientEntry {
  controller: Option<String>,
  last_seen: u64,
}

#[derive(Default)]
struct Clients {
  entries: HashMap<String, ClientEntry>,
  clock: u64,
}

/// Pages seen by the gateway and the version controlling each.
///
/// Client ids come from request headers, so the registry is bounded.
pub struct ClientRegistry {
  clients: Mutex<Clients>,
  capacity: usize,
}

impl Default for ClientRegistry {
  fn default() -> Self {
    Self::with_capacity(MAX_CLIENTS)
  }
}

impl ClientRegistry {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      clients: Mutex::new(Clients::default()),
      capacity: capacity.max(1),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Clients> {
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Record a request from `client` and report whether it is controlled.
  ///
  /// An uncontrolled client becomes controlled by navigating while a worker
  /// is active.
  pub fn observe(&self, client: &str, navigation: bool, active_version: &str) -> bool {
    let mut clients = self.lock();
    clients.clock += 1;
    let now = clients.clock;

    if !clients.entries.contains_key(client) && clients.entries.len() >= self.capacity {
      let oldest = clients
        .entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_seen)
        .map(|(id, _)| id.clone());
      if let Some(oldest) = oldest {
        debug!(client = %oldest, "forgetting least recently seen client");
        clients.entries.remove(&oldest);
      }
    }

    let entry = clients
      .entries
      .entry(client.to_string())
      .or_insert(ClientEntry {
        controller: None,
        last_seen: now,
      });
    entry.last_seen = now;
    if entry.controller.is_none() && navigation {
      entry.controller = Some(active_version.to_string());
    }
    entry.controller.is_some()
  }

  /// Take control of every known client. Returns how many were claimed.
  pub fn claim(&self, version: &str) -> usize {
    let mut clients = self.lock();
    for entry in clients.entries.values_mut() {
      entry.controller = Some(version.to_string());
    }
    clients.entries.len()
  }

  pub fn controller(&self, client: &str) -> Option<String> {
    self
      .lock()
      .entries
      .get(client)
      .and_then(|entry| entry.controller.clone())
  }

  fn counts(&self) -> (usize, usize) {
    let clients = self.lock();
    let controlled = clients
      .entries
      .values()
      .filter(|entry| entry.controller.is_some())
      .count();
    (clients.entries.len(), controlled)
  }
}

#[derive(Default)]
struct Slots {
  active: Option<Arc<Worker>>,
  waiting: Option<Arc<Worker>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
  pub version: String,
  pub state: WorkerState,
}

impl WorkerStatus {
  fn of(worker: &Worker) -> Self {
    Self {
      version: worker.version().to_string(),
      state: worker.state(),
    }
  }
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
  pub active: Option<WorkerStatus>,
  pub waiting: Option<WorkerStatus>,
  pub caches: Vec<String>,
  pub pending_actions: usize,
  pub clients: usize,
  pub controlled_clients: usize,
}

pub struct Registration {
  ctx: Arc<WorkerContext>,
  slots: RwLock<Slots>,
  clients: ClientRegistry,
  /// Only one install or activation runs at a time
  transition: tokio::sync::Mutex<()>,
}

impl Registration {
  pub fn new(ctx: Arc<WorkerContext>) -> Self {
    Self {
      ctx,
      slots: RwLock::new(Slots::default()),
      clients: ClientRegistry::default(),
      transition: tokio::sync::Mutex::new(()),
    }
  }

  pub fn active(&self) -> Option<Arc<Worker>> {
    self.slots.read().unwrap_or_else(|e| e.into_inner()).active.clone()
  }

  pub fn waiting(&self) -> Option<Arc<Worker>> {
    self.slots.read().unwrap_or_else(|e| e.into_inner()).waiting.clone()
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn context(&self) -> &Arc<WorkerContext> {
    &self.ctx
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install { version } => {
        self.install(&version).await?;
        Ok(EventOutcome::Handled)
      }
      WorkerEvent::Fetch(request) => self.fetch(request).await,
      WorkerEvent::Message(ClientMessage::SkipWaiting) => {
        self.skip_waiting().await?;
        Ok(EventOutcome::Handled)
      }
      WorkerEvent::Message(ClientMessage::Unknown) => {
        debug!("ignoring unknown client message");
        Ok(EventOutcome::Ignore)
      }
      WorkerEvent::Push(payload) => Ok(match self.active() {
        Some(worker) => worker.handle_push(&payload),
        None => EventOutcome::Ignore,
      }),
      WorkerEvent::NotificationClick(click) => Ok(match self.active() {
        Some(worker) => worker.handle_notification_click(&click),
        None => EventOutcome::Ignore,
      }),
      WorkerEvent::Sync { tag } => Ok(match self.active() {
        Some(worker) => worker.handle_sync(&tag),
        None => EventOutcome::Ignore,
      }),
    }
  }

  async fn fetch(&self, request: Request) -> Result<EventOutcome> {
    let Some(worker) = self.active() else {
      return Ok(EventOutcome::Ignore);
    };

    if let Some(client) = request.client_id() {
      let navigation = request.destination() == Destination::Document;
      if !self.clients.observe(client, navigation, worker.version()) {
        debug!(client, url = %request.url, "client not controlled, not intercepting");
        return Ok(EventOutcome::Ignore);
      }
    }

    worker.handle_fetch(request).await
  }

  /// Install `version`. The first version activates right away; later ones
  /// wait for `SKIP_WAITING`.
  pub async fn install(&self, version: &str) -> Result<()> {
    let _transition = self.transition.lock().await;

    if self.active().is_some_and(|w| w.version() == version) {
      info!(version, "version already active");
      return Ok(());
    }
    if self.waiting().is_some_and(|w| w.version() == version) {
      info!(version, "version already waiting");
      return Ok(());
    }

    let worker = Arc::new(Worker::new(Arc::clone(&self.ctx), version));
    worker.install().await?;

    if self.active().is_none() {
      return self.activate(worker);
    }

    info!(version, "installed, waiting to activate");
    let previous = self
      .slots
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .waiting
      .replace(worker);
    if let Some(previous) = previous {
      previous.set_state(WorkerState::Redundant);
    }
    Ok(())
  }

  /// Promote the waiting worker, if any, without waiting for pages to close.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let _transition = self.transition.lock().await;

    let waiting = self
      .slots
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .waiting
      .take();

    match waiting {
      Some(worker) => {
        self.activate(worker)?;
        Ok(true)
      }
      None => {
        debug!("skip waiting requested with no waiting worker");
        Ok(false)
      }
    }
  }

  /// Must run under the transition lock.
  fn activate(&self, worker: Arc<Worker>) -> Result<()> {
    let deleted = match worker.activate() {
      Ok(deleted) => deleted,
      Err(err) => {
        warn!(version = %worker.version(), error = %err, "activation failed");
        worker.set_state(WorkerState::Redundant);
        return Err(err);
      }
    };

    let previous = self
      .slots
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .active
      .replace(Arc::clone(&worker));
    if let Some(previous) = previous {
      previous.set_state(WorkerState::Redundant);
    }

    let claimed = self.clients.claim(worker.version());
    info!(
      version = %worker.version(),
      deleted_caches = deleted.len(),
      claimed,
      "worker active"
    );
    Ok(())
  }

  pub fn status(&self) -> Result<RegistrationStatus> {
    let (clients, controlled_clients) = self.clients.counts();
    Ok(RegistrationStatus {
      active: self.active().map(|w| WorkerStatus::of(&w)),
      waiting: self.waiting().map(|w| WorkerStatus::of(&w)),
      caches: self.ctx.store.keys()?,
      pending_actions: self.ctx.queue.len()?,
      clients,
      controlled_clients,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::net::mock::MockNetwork;
  use crate::net::CLIENT_ID_HEADER;
  use crate::worker::test_context;
  use reqwest::StatusCode;
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8080/").unwrap().join(path).unwrap()
  }

  fn registration() -> (Arc<MockNetwork>, Registration) {
    let network = Arc::new(MockNetwork::new());
    (network.clone(), Registration::new(test_context(network)))
  }

  #[tokio::test]
  async fn test_fetch_before_install_is_ignored() {
    let (network, registration) = registration();
    let outcome = registration
      .dispatch(WorkerEvent::Fetch(Request::get(url("/api/v1/rooms"))))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignore));
    assert!(network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_first_install_activates() {
    let (_network, registration) = registration();
    registration
      .dispatch(WorkerEvent::Install {
        version: "1.0.0".to_string(),
      })
      .await
      .unwrap();

    let active = registration.active().unwrap();
    assert_eq!(active.version(), "1.0.0");
    assert_eq!(active.state(), WorkerState::Activated);
    assert!(registration.waiting().is_none());
  }

  #[tokio::test]
  async fn test_update_waits_then_skip_waiting_activates() {
    let (_network, registration) = registration();
    registration.install("1.0.0").await.unwrap();
    let old = registration.active().unwrap();

    // A page is controlled by 1.0.0
    let nav = Request::navigate(url("/rooms")).with_header(CLIENT_ID_HEADER, "tab-1");
    registration.dispatch(WorkerEvent::Fetch(nav)).await.unwrap();
    assert_eq!(
      registration.clients().controller("tab-1").as_deref(),
      Some("1.0.0")
    );

    registration.install("1.0.1").await.unwrap();
    assert_eq!(registration.active().unwrap().version(), "1.0.0");
    assert_eq!(registration.waiting().unwrap().state(), WorkerState::Installed);

    let outcome = registration
      .dispatch(WorkerEvent::Message(ClientMessage::SkipWaiting))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Handled));

    assert_eq!(registration.active().unwrap().version(), "1.0.1");
    assert!(registration.waiting().is_none());
    assert_eq!(old.state(), WorkerState::Redundant);
    assert_eq!(
      registration.clients().controller("tab-1").as_deref(),
      Some("1.0.1")
    );

    let status = registration.status().unwrap();
    let mut caches = status.caches;
    caches.sort();
    assert_eq!(caches, vec!["app-dynamic-v1.0.1", "app-static-v1.0.1"]);
    assert_eq!(status.controlled_clients, 1);
  }

  #[tokio::test]
  async fn test_replaced_worker_does_not_recreate_pruned_cache() {
    let (network, registration) = registration();
    network.route_get(url("/rooms").as_str(), StatusCode::OK, "<h1>Rooms</h1>");
    registration.install("1.0.0").await.unwrap();
    let old = registration.active().unwrap();

    registration.install("1.0.1").await.unwrap();
    registration.skip_waiting().await.unwrap();

    // A navigation that was still being handled by the old version
    old
      .handle_fetch(Request::navigate(url("/rooms")))
      .await
      .unwrap();

    let mut caches = registration.status().unwrap().caches;
    caches.sort();
    assert_eq!(caches, vec!["app-dynamic-v1.0.1", "app-static-v1.0.1"]);
  }

  #[tokio::test]
  async fn test_reinstalling_active_version_is_noop() {
    let (_network, registration) = registration();
    registration.install("1.0.0").await.unwrap();
    let first = registration.active().unwrap();
    registration.install("1.0.0").await.unwrap();
    assert!(Arc::ptr_eq(&first, &registration.active().unwrap()));
    assert!(registration.waiting().is_none());
  }

  #[tokio::test]
  async fn test_skip_waiting_without_waiting_worker() {
    let (_network, registration) = registration();
    registration.install("1.0.0").await.unwrap();
    assert!(!registration.skip_waiting().await.unwrap());
  }

  #[tokio::test]
  async fn test_uncontrolled_client_subresources_pass_through() {
    let (network, registration) = registration();
    network.route_get(url("/api/v1/rooms").as_str(), StatusCode::OK, "[]");
    registration.install("1.0.0").await.unwrap();

    let api = Request::get(url("/api/v1/rooms")).with_header(CLIENT_ID_HEADER, "tab-2");
    let outcome = registration
      .dispatch(WorkerEvent::Fetch(api.clone()))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignore));

    // Claimed on the next activation, intercepted afterwards
    registration.clients().claim("1.0.0");
    let outcome = registration.dispatch(WorkerEvent::Fetch(api)).await.unwrap();
    match outcome {
      EventOutcome::Respond(served) => assert_eq!(served.source, CacheSource::Network),
      _ => panic!("expected a response"),
    }
  }

  #[test]
  fn test_client_registry_is_bounded() {
    let clients = ClientRegistry::with_capacity(2);
    assert!(clients.observe("tab-1", true, "1.0.0"));
    assert!(!clients.observe("tab-2", false, "1.0.0"));
    // tab-1 seen again, so tab-2 is now the least recently seen
    assert!(clients.observe("tab-1", false, "1.0.0"));

    for i in 0..100 {
      clients.observe(&format!("spoofed-{}", i), false, "1.0.0");
    }
    assert_eq!(clients.counts().0, 2);
    assert!(clients.controller("tab-2").is_none());
  }

  #[test]
  fn test_client_registry_keeps_recent_clients() {
    let clients = ClientRegistry::with_capacity(2);
    clients.observe("tab-1", true, "1.0.0");
    clients.observe("tab-2", true, "1.0.0");
    clients.observe("tab-1", false, "1.0.0");
    clients.observe("tab-3", true, "1.0.0");

    assert_eq!(clients.controller("tab-1").as_deref(), Some("1.0.0"));
    assert!(clients.controller("tab-2").is_none());
    assert_eq!(clients.controller("tab-3").as_deref(), Some("1.0.0"));
  }

  #[tokio::test]
  async fn test_events_without_active_worker_are_ignored() {
    let (_network, registration) = registration();
    let outcome = registration
      .dispatch(WorkerEvent::Sync {
        tag: "background-sync".to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignore));
  }
}
