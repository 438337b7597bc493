//! In-memory and SQLite cache storage implementations.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::Database;

use super::traits::{CacheStorage, CachedResponse};

struct NamedCache {
  name: String,
  entries: HashMap<String, CachedResponse>,
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<Vec<NamedCache>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_caches<R>(&self, f: impl FnOnce(&mut Vec<NamedCache>) -> R) -> Result<R> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut caches))
  }
}

fn open_in(caches: &mut Vec<NamedCache>, name: &str) -> usize {
  match caches.iter().position(|c| c.name == name) {
    Some(idx) => idx,
    None => {
      caches.push(NamedCache {
        name: name.to_string(),
        entries: HashMap::new(),
      });
      caches.len() - 1
    }
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, cache: &str) -> Result<()> {
    self.with_caches(|caches| {
      open_in(caches, cache);
    })
  }

  fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()> {
    self.with_caches(|caches| {
      let idx = open_in(caches, cache);
      caches[idx]
        .entries
        .insert(entry.url.clone(), entry.clone());
    })
  }

  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
    self.with_caches(|caches| {
      caches
        .iter()
        .find(|c| c.name == cache)
        .and_then(|c| c.entries.get(key).cloned())
    })
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    self.with_caches(|caches| caches.iter().map(|c| c.name.clone()).collect())
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    self.with_caches(|caches| {
      let before = caches.len();
      caches.retain(|c| c.name != cache);
      caches.len() != before
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// SHA256 of the request identity for stable, fixed-length keys.
fn entry_key(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn decode_entry(row: EntryRow) -> Result<CachedResponse> {
  let (url, status, headers, body, stored_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
  let stored_at = DateTime::parse_from_rfc3339(&stored_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", stored_at, e))?;

  Ok(CachedResponse {
    url,
    status,
    headers,
    body: Bytes::from(body),
    stored_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;
    Ok(())
  }

  fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, entry_key, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        cache,
        entry_key(&entry.url),
        entry.url,
        entry.status,
        headers,
        entry.body.as_ref(),
        entry.stored_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND entry_key = ?",
        params![cache, entry_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache, e))?;

    row.map(decode_entry).transpose()
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_any(&self, key: &str) -> Result<Option<(String, CachedResponse)>> {
    let conn = self.db.lock()?;

    let row: Option<(String, EntryRow)> = conn
      .query_row(
        "SELECT ce.cache_name, ce.url, ce.status, ce.headers, ce.body, ce.stored_at
         FROM cache_entries ce
         INNER JOIN caches c ON c.name = ce.cache_name
         WHERE ce.entry_key = ?
         ORDER BY c.seq
         LIMIT 1",
        params![entry_key(key)],
        |row| {
          Ok((
            row.get(0)?,
            (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", key, e))?;

    row
      .map(|(name, entry)| decode_entry(entry).map(|entry| (name, entry)))
      .transpose()
  }
}
