//! Fetch strategies.
//!
//! Each strategy is a short linear flow over two sources, network and cache.
//! Network failure is the only condition they branch on: cache read errors
//! count as misses and cache write errors are logged and dropped.

use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::cache::{CacheNames, CacheSource, CacheStore, CachedResponse, Served};
use crate::net::{FetchError, Network, Request, Response};

use super::offline;
use super::queue::{is_replayable, PendingAction};
use super::{WorkerContext, WorkerState};

/// Strategies bound to one worker version's caches.
#[derive(Clone)]
pub struct Strategies {
  ctx: Arc<WorkerContext>,
  names: CacheNames,
  /// State of the owning worker; a redundant worker stops writing its caches
  state: Arc<RwLock<WorkerState>>,
}

impl Strategies {
  pub fn new(ctx: Arc<WorkerContext>, names: CacheNames, state: Arc<RwLock<WorkerState>>) -> Self {
    Self { ctx, names, state }
  }

  /// Network first; cache, then the offline page, then a synthesized page.
  pub async fn document(&self, request: &Request) -> Served {
    match self.ctx.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&self.names.dynamic_cache(), request, &response);
        }
        Served::from_network(response)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "document fetch failed, trying cache");

        if let Some(entry) = self.lookup(request) {
          return Served::from_cache(&entry);
        }

        if let Some(entry) = self.offline_page() {
          let mut served = Served::from_cache(&entry);
          served.source = CacheSource::OfflinePage;
          return served;
        }

        Served::synthesized(offline::document(), CacheSource::Offline)
      }
    }
  }

  /// Stale-while-revalidate for cacheable endpoints, network first otherwise.
  pub async fn api(&self, request: &Request) -> Served {
    let cacheable = self.is_cacheable_api(request.url.path());

    if cacheable {
      if let Some(entry) = self.lookup(request) {
        debug!(url = %request.url, "serving cached api response, refreshing in background");
        return Served::from_cache(&entry).with_refresh(self.spawn_refresh(request.clone()));
      }
    }

    match self.ctx.network.fetch(request).await {
      Ok(response) => {
        if cacheable && response.ok() {
          self.store(&self.names.dynamic_cache(), request, &response);
        }
        Served::from_network(response)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "api fetch failed");
        if cacheable {
          if let Some(entry) = self.lookup(request) {
            return Served::from_cache(&entry);
          }
        }
        Served::synthesized(offline::api(), CacheSource::Offline)
      }
    }
  }

  /// Cache first. Static assets have no safe placeholder, so a miss on both
  /// sides is an error.
  pub async fn static_asset(&self, request: &Request) -> Result<Served, FetchError> {
    if let Some(entry) = self.lookup(request) {
      return Ok(Served::from_cache(&entry));
    }

    match self.ctx.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&self.names.static_cache(), request, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(err) => {
        // Another handler may have stored it while we were waiting
        if let Some(entry) = self.lookup(request) {
          return Ok(Served::from_cache(&entry));
        }
        warn!(url = %request.url, error = %err, "static asset unavailable");
        Err(err)
      }
    }
  }

  /// Network only, with whatever the caches happen to hold as a backup.
  pub async fn fallback(&self, request: &Request) -> Result<Served, FetchError> {
    match self.ctx.network.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => match self.lookup(request) {
        Some(entry) => Ok(Served::from_cache(&entry)),
        None => Err(err),
      },
    }
  }

  /// Non-GET requests bypass the caches. When the network is unreachable a
  /// POST, PUT, PATCH or DELETE is queued for background sync, if queueing is
  /// enabled.
  pub async fn mutation(&self, request: &Request) -> Result<Served, FetchError> {
    let err = match self.ctx.network.fetch(request).await {
      Ok(response) => return Ok(Served::from_network(response)),
      Err(err) => err,
    };

    if !self.ctx.queue_config.enabled || !is_replayable(&request.method) {
      return Err(err);
    }

    let action = PendingAction::record(request);
    match self.ctx.queue.enqueue(&action) {
      Ok(()) => {
        debug!(id = %action.id, method = %request.method, url = %request.url, "queued for background sync");
        Ok(Served::synthesized(
          offline::queued(action.id),
          CacheSource::Queued,
        ))
      }
      Err(queue_err) => {
        warn!(url = %request.url, error = %queue_err, "failed to queue offline request");
        Err(err)
      }
    }
  }

  fn is_cacheable_api(&self, path: &str) -> bool {
    self
      .ctx
      .config
      .api_cache_patterns
      .iter()
      .any(|pattern| path.starts_with(pattern.as_str()))
  }

  fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    self.ctx.store.lookup(request).unwrap_or_else(|err| {
      warn!(url = %request.url, error = %err, "cache lookup failed");
      None
    })
  }

  fn offline_page(&self) -> Option<CachedResponse> {
    let url = self.ctx.scope.join(&self.ctx.config.offline_page).ok()?;
    self.lookup(&Request::get(url))
  }

  fn store(&self, cache: &str, request: &Request, response: &Response) {
    if is_redundant(&self.state) {
      debug!(cache = %cache, url = %request.url, "worker is redundant, not caching");
      return;
    }
    if let Err(err) = self.ctx.store.put(cache, request, response) {
      warn!(cache = %cache, url = %request.url, error = %err, "failed to cache response");
    }
  }

  /// Detached refresh of a cached API response. Nobody awaits the result;
  /// failures end up in the log only.
  fn spawn_refresh(&self, request: Request) -> JoinHandle<()> {
    let store = self.ctx.store.clone();
    let network: Arc<dyn Network> = Arc::clone(&self.ctx.network);
    let cache = self.names.dynamic_cache();
    let state = Arc::clone(&self.state);
    let span = tracing::debug_span!("background_refresh", url = %request.url);

    tokio::spawn(
      async move {
        refresh(&store, network.as_ref(), &state, &cache, &request).await;
      }
      .instrument(span),
    )
  }
}

fn is_redundant(state: &RwLock<WorkerState>) -> bool {
  *state.read().unwrap_or_else(|e| e.into_inner()) == WorkerState::Redundant
}

async fn refresh(
  store: &CacheStore,
  network: &dyn Network,
  state: &RwLock<WorkerState>,
  cache: &str,
  request: &Request,
) {
  match network.fetch(request).await {
    // The cache may have been pruned by a newer version while we waited
    Ok(_) if is_redundant(state) => debug!("worker is redundant, dropping refreshed response"),
    Ok(response) if response.ok() => {
      if let Err(err) = store.put(cache, request, &response) {
        debug!(error = %err, "failed to store refreshed response");
      }
    }
    Ok(response) => debug!(status = %response.status, "refresh returned an error status"),
    Err(err) => debug!(error = %err, "refresh failed"),
  }
}
