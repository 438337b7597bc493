//! Durable queue of mutating requests that failed while offline.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use rusqlite::params;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::Database;
use crate::net::{Network, Request};

/// Sync tag that triggers a replay of the queue.
pub const SYNC_TAG: &str = "background-sync";

/// Whether a failed request with this method may be queued for replay.
/// Only state-changing methods are; HEAD, OPTIONS and the like just fail.
pub fn is_replayable(method: &Method) -> bool {
  [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}

/// A recorded request waiting to be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
  pub id: Uuid,
  pub url: String,
  pub method: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  /// Failed replays so far
  pub attempts: u32,
  pub created_at: DateTime<Utc>,
}

impl PendingAction {
  pub fn record(request: &Request) -> Self {
    Self {
      id: Uuid::new_v4(),
      url: request.url.to_string(),
      method: request.method.to_string(),
      headers: request
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
        .collect(),
      body: request.body.clone(),
      attempts: 0,
      created_at: Utc::now(),
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {:?} in action {}: {}", self.method, self.id, e))?;
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Invalid url {:?} in action {}: {}", self.url, self.id, e))?;

    let mut headers = HeaderMap::with_capacity(self.headers.len());
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    Ok(Request {
      method,
      url,
      headers,
      body: self.body.clone(),
    })
  }
}

/// Trait for queue storage backends.
pub trait ActionQueue: Send + Sync {
  fn enqueue(&self, action: &PendingAction) -> Result<()>;

  /// All pending actions, oldest first.
  fn pending(&self) -> Result<Vec<PendingAction>>;

  fn remove(&self, id: Uuid) -> Result<()>;

  /// Record a failed replay and return the new attempt count.
  fn record_failure(&self, id: Uuid) -> Result<u32>;

  fn len(&self) -> Result<usize> {
    Ok(self.pending()?.len())
  }
}

/// Queue that lives only as long as the process.
#[derive(Default)]
pub struct MemoryQueue {
  actions: Mutex<Vec<PendingAction>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_actions<R>(&self, f: impl FnOnce(&mut Vec<PendingAction>) -> R) -> Result<R> {
    let mut actions = self
      .actions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut actions))
  }
}

impl ActionQueue for MemoryQueue {
  fn enqueue(&self, action: &PendingAction) -> Result<()> {
    self.with_actions(|actions| actions.push(action.clone()))
  }

  fn pending(&self) -> Result<Vec<PendingAction>> {
    self.with_actions(|actions| actions.clone())
  }

  fn remove(&self, id: Uuid) -> Result<()> {
    self.with_actions(|actions| actions.retain(|a| a.id != id))
  }

  fn record_failure(&self, id: Uuid) -> Result<u32> {
    self
      .with_actions(|actions| {
        actions.iter_mut().find(|a| a.id == id).map(|a| {
          a.attempts += 1;
          a.attempts
        })
      })?
      .ok_or_else(|| eyre!("Unknown pending action {}", id))
  }
}

/// SQLite-backed queue; survives restarts between sync events.
pub struct SqliteQueue {
  db: Database,
}

impl SqliteQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

type ActionRow = (String, String, String, String, Vec<u8>, u32, String);

fn decode_action(row: ActionRow) -> Result<PendingAction> {
  let (id, url, method, headers, body, attempts, created_at) = row;
  Ok(PendingAction {
    id: Uuid::parse_str(&id).map_err(|e| eyre!("Invalid action id {:?}: {}", id, e))?,
    url,
    method,
    headers: serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of action {}: {}", id, e))?,
    body: Bytes::from(body),
    attempts,
    created_at: DateTime::parse_from_rfc3339(&created_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse datetime '{}': {}", created_at, e))?,
  })
}

impl ActionQueue for SqliteQueue {
  fn enqueue(&self, action: &PendingAction) -> Result<()> {
    let headers = serde_json::to_string(&action.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .lock()?
      .execute(
        "INSERT INTO pending_actions (id, url, method, headers, body, attempts, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          action.id.to_string(),
          action.url,
          action.method,
          headers,
          action.body.as_ref(),
          action.attempts,
          action.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue action: {}", e))?;
    Ok(())
  }

  fn pending(&self) -> Result<Vec<PendingAction>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, attempts, created_at FROM pending_actions
         ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending actions: {}", e))?
      .collect::<rusqlite::Result<Vec<ActionRow>>>()
      .map_err(|e| eyre!("Failed to read pending action: {}", e))?;

    rows.into_iter().map(decode_action).collect()
  }

  fn remove(&self, id: Uuid) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "DELETE FROM pending_actions WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to remove action {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: Uuid) -> Result<u32> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "UPDATE pending_actions SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        params![id.to_string()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to update action {}: {}", id, e))
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count pending actions: {}", e))?;
    Ok(count as usize)
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  /// Sent successfully and removed
  pub replayed: usize,
  /// Still queued for the next sync
  pub failed: usize,
  /// Gave up after too many attempts
  pub dropped: usize,
}

/// Replay every pending action in order.
///
/// Only a 2xx answer counts as delivered; anything else stays queued until it
/// has failed `max_attempts` times.
pub async fn replay(
  queue: &dyn ActionQueue,
  network: &dyn Network,
  max_attempts: u32,
) -> Result<ReplayReport> {
  let mut report = ReplayReport::default();

  for action in queue.pending()? {
    let request = match action.to_request() {
      Ok(request) => request,
      Err(err) => {
        warn!(id = %action.id, error = %err, "dropping unreadable action");
        queue.remove(action.id)?;
        report.dropped += 1;
        continue;
      }
    };

    let delivered = match network.fetch(&request).await {
      Ok(response) if response.ok() => true,
      Ok(response) => {
        debug!(id = %action.id, status = %response.status, "replay rejected");
        false
      }
      Err(err) => {
        debug!(id = %action.id, error = %err, "replay failed");
        false
      }
    };

    if delivered {
      queue.remove(action.id)?;
      report.replayed += 1;
      continue;
    }

    let attempts = queue.record_failure(action.id)?;
    if attempts >= max_attempts {
      warn!(
        id = %action.id,
        method = %action.method,
        url = %action.url,
        attempts,
        "dropping action after repeated failures"
      );
      queue.remove(action.id)?;
      report.dropped += 1;
    } else {
      report.failed += 1;
    }
  }

  info!(
    replayed = report.replayed,
    failed = report.failed,
    dropped = report.dropped,
    "background sync finished"
  );
  Ok(report)
}
