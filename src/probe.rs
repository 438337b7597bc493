//! Periodic reachability check of the upstream. While it answers, queued
//! mutations are replayed through a background sync on every tick.

use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::event::{EventOutcome, WorkerEvent};
use crate::net::Request;
use crate::worker::queue::SYNC_TAG;
use crate::worker::Registration;

pub fn spawn(registration: Arc<Registration>, interval: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut online = false;
    loop {
      ticker.tick().await;
      online = check(&registration, online).await;
    }
  })
}

/// Probe once and return whether the upstream answered.
///
/// Actions can be queued during an outage shorter than the probe interval,
/// or stay queued after a rejected replay, so any pending action is retried
/// whenever the upstream is reachable, not only on reconnect.
pub async fn check(registration: &Registration, was_online: bool) -> bool {
  let ctx = registration.context();
  let probe = Request::new(Method::HEAD, ctx.scope.clone());
  let online = ctx.network.fetch(&probe).await.is_ok();

  match (was_online, online) {
    (false, true) => info!("upstream reachable"),
    (true, false) => warn!("upstream unreachable, serving from cache"),
    _ => {}
  }
  if online {
    replay_pending(registration).await;
  }
  online
}

async fn replay_pending(registration: &Registration) {
  let pending = match registration.context().queue.len() {
    Ok(pending) => pending,
    Err(err) => {
      warn!(error = %err, "failed to read offline queue");
      return;
    }
  };
  if pending == 0 {
    return;
  }

  let event = WorkerEvent::Sync {
    tag: SYNC_TAG.to_string(),
  };
  match registration.dispatch(event).await {
    Ok(EventOutcome::Deferred(task)) => match task.await {
      Ok(Ok(report)) => info!(
        replayed = report.replayed,
        failed = report.failed,
        dropped = report.dropped,
        "background sync finished"
      ),
      Ok(Err(err)) => warn!(error = %err, "background sync failed"),
      Err(err) => warn!(error = %err, "background sync task panicked"),
    },
    Ok(_) => debug!(pending, "no active worker to sync"),
    Err(err) => warn!(error = %err, "failed to dispatch background sync"),
  }
}
