//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::traits::CachedResponse;
use crate::db::Database;
use crate::net::CapturedResponse;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store a response under (method, url), replacing any previous entry.
  fn put(
    &self,
    cache_name: &str,
    method: &str,
    url: &str,
    response: &CapturedResponse,
  ) -> Result<()>;

  /// Look up the response stored under (method, url).
  fn lookup(&self, cache_name: &str, method: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Names of every cache that holds at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a whole cache. Returns the number of entries removed.
  fn delete_cache(&self, cache_name: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put(&self, _: &str, _: &str, _: &str, _: &CapturedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn lookup(&self, _: &str, _: &str, _: &str) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _: &str) -> Result<usize> {
    Ok(0)
  }
}

impl CacheStorage for Box<dyn CacheStorage> {
  fn put(
    &self,
    cache_name: &str,
    method: &str,
    url: &str,
    response: &CapturedResponse,
  ) -> Result<()> {
    (**self).put(cache_name, method, url, response)
  }

  fn lookup(&self, cache_name: &str, method: &str, url: &str) -> Result<Option<CachedResponse>> {
    (**self).lookup(cache_name, method, url)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    (**self).cache_names()
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    (**self).delete_cache(cache_name)
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// SHA256 of the method and URL for stable, fixed-length keys.
pub fn entry_key(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.to_uppercase().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

impl CacheStorage for SqliteStorage {
  fn put(
    &self,
    cache_name: &str,
    method: &str,
    url: &str,
    response: &CapturedResponse,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let key = entry_key(method, url);

    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO cache_entries
             (cache_name, entry_key, method, url, status, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
          params![
            cache_name,
            key,
            method.to_uppercase(),
            url,
            response.status,
            headers,
            response.body,
            Utc::now().timestamp_millis()
          ],
        )
        .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
      Ok(())
    })
  }

  fn lookup(&self, cache_name: &str, method: &str, url: &str) -> Result<Option<CachedResponse>> {
    let key = entry_key(method, url);

    let row: Option<(u16, String, Vec<u8>, i64)> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT status, headers, body, cached_at FROM cache_entries
           WHERE cache_name = ? AND entry_key = ?",
          params![cache_name, key],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to query cache: {}", e))
    })?;

    match row {
      Some((status, headers_json, body, cached_at_ms)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: CapturedResponse {
            status,
            headers,
            body,
          },
          cached_at: parse_millis(cached_at_ms)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to query cache names: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read cache name: {}", e))?;
      Ok(names)
    })
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE cache_name = ?",
          params![cache_name],
        )
        .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))
    })
  }
}

/// Convert stored epoch milliseconds back to a timestamp.
fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid cache timestamp {}", ms))
}
