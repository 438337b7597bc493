//! Install and activate steps of a worker version.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::net::Request;

use super::Worker;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Created, nothing run yet
  Parsed,
  /// Pre-caching the static manifest
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Pruning caches from older versions
  Activating,
  /// Handling fetches
  Activated,
  /// Replaced by a newer version or failed to install
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

impl Worker {
  pub fn state(&self) -> WorkerState {
    *self.state.read().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn set_state(&self, state: WorkerState) {
    let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
    if *current != state {
      info!(version = %self.version(), from = %*current, to = %state, "worker state changed");
      *current = state;
    }
  }

  /// Open the static cache and fill it with the precache manifest.
  ///
  /// Entries are fetched concurrently and stored one by one. Unless
  /// `strict_install` is set, entries that fail are logged and skipped.
  pub async fn install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    let cache = self.names.static_cache();
    if let Err(err) = self.ctx.store.open(&cache) {
      self.set_state(WorkerState::Redundant);
      return Err(err);
    }

    let results = join_all(
      self
        .ctx
        .config
        .precache
        .iter()
        .map(|path| self.precache(&cache, path)),
    )
    .await;

    let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
    for err in &failures {
      warn!(cache = %cache, error = %err, "precache failed");
    }

    if !failures.is_empty() && self.ctx.config.strict_install {
      if let Err(err) = self.ctx.store.delete(&cache) {
        warn!(cache = %cache, error = %err, "failed to discard partial static cache");
      }
      self.set_state(WorkerState::Redundant);
      return Err(eyre!(
        "Install of version {} failed: {} of {} precache entries unavailable",
        self.version(),
        failures.len(),
        self.ctx.config.precache.len()
      ));
    }

    info!(
      version = %self.version(),
      cached = self.ctx.config.precache.len() - failures.len(),
      failed = failures.len(),
      "install complete"
    );
    self.set_state(WorkerState::Installed);
    Ok(())
  }

  async fn precache(&self, cache: &str, path: &str) -> Result<()> {
    let url = self
      .ctx
      .scope
      .join(path)
      .map_err(|e| eyre!("Invalid precache path {:?}: {}", path, e))?;
    let request = Request::get(url);

    let response = self
      .ctx
      .network
      .fetch(&request)
      .await
      .map_err(|e| eyre!("{}: {}", path, e))?;
    if !response.ok() {
      return Err(eyre!("{}: upstream answered {}", path, response.status));
    }

    self.ctx.store.put(cache, &request, &response)
  }

  /// Delete caches of every other version. Returns the deleted names.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    let deleted = self.ctx.store.delete_stale(&self.names)?;
    self.ctx.store.open(&self.names.dynamic_cache())?;

    self.set_state(WorkerState::Activated);
    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::WorkerConfig;
  use crate::net::mock::MockNetwork;
  use crate::worker::{test_context, test_context_with, RecordingNotifier};
  use reqwest::StatusCode;
  use std::sync::Arc;

  const ORIGIN: &str = "http://localhost:8080";

  fn route_manifest(network: &MockNetwork, config: &WorkerConfig) {
    for path in &config.precache {
      network.route_get(&format!("{}{}", ORIGIN, path), StatusCode::OK, path);
    }
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let network = Arc::new(MockNetwork::new());
    let ctx = test_context(network.clone());
    route_manifest(&network, &ctx.config);

    let worker = Worker::new(ctx.clone(), "1.0.0");
    worker.install().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Installed);
    for path in &ctx.config.precache {
      let request = Request::get(ctx.scope.join(path).unwrap());
      assert!(
        ctx
          .store
          .lookup_in("app-static-v1.0.0", &request)
          .unwrap()
          .is_some(),
        "{} not cached",
        path
      );
    }
  }

  #[tokio::test]
  async fn test_best_effort_install_tolerates_failures() {
    let network = Arc::new(MockNetwork::new());
    let ctx = test_context(network.clone());
    // Only the root document is reachable, everything else 404s
    network.route_get(&format!("{}/", ORIGIN), StatusCode::OK, "<html></html>");

    let worker = Worker::new(ctx.clone(), "1.0.0");
    worker.install().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Installed);
    assert!(ctx
      .store
      .lookup(&Request::get(ctx.scope.clone()))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_strict_install_fails_and_discards_cache() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let config = WorkerConfig {
      cache_prefix: "app".to_string(),
      strict_install: true,
      ..WorkerConfig::default()
    };
    let ctx = test_context_with(network, config, Arc::new(RecordingNotifier::default()));

    let worker = Worker::new(ctx.clone(), "1.0.0");
    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(ctx.store.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_prunes_older_versions() {
    let network = Arc::new(MockNetwork::new());
    let ctx = test_context(network);
    for cache in ["app-static-v1.0.0", "app-dynamic-v1.0.0", "cdn-fonts"] {
      ctx.store.open(cache).unwrap();
    }

    let worker = Worker::new(ctx.clone(), "1.0.1");
    worker.install().await.unwrap();
    let deleted = worker.activate().unwrap();

    assert_eq!(deleted, vec!["app-static-v1.0.0", "app-dynamic-v1.0.0"]);
    let mut caches = ctx.store.keys().unwrap();
    caches.sort();
    assert_eq!(
      caches,
      vec!["app-dynamic-v1.0.1", "app-static-v1.0.1", "cdn-fonts"]
    );
    assert_eq!(worker.state(), WorkerState::Activated);
  }
}
