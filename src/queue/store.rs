//! SQLite-backed persistent queue of mutating requests.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;

use super::types::{AttemptState, FailedMutation, NewMutation, PendingMutation, QueuedMutation};
use crate::db::Database;
use crate::net::normalize_headers;

const MUTATION_COLUMNS: &str = "m.id, m.url, m.method, m.raw_body, m.headers, m.created_at, m.source";

/// Durable queue of mutations awaiting replay.
#[derive(Clone)]
pub struct QueueStore {
  db: Database,
}

impl QueueStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn database(&self) -> &Database {
    &self.db
  }

  /// Append a mutation. Returns once the transaction has committed.
  pub fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
    let headers = serde_json::to_string(&normalize_headers(&mutation.headers))
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self.db.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute(
        "INSERT INTO queued_mutations (url, method, raw_body, headers, created_at, source)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          mutation.url,
          mutation.method.to_uppercase(),
          mutation.raw_body,
          headers,
          mutation.created_at,
          mutation.source
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;
      let id = tx.last_insert_rowid();

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(id)
    })
  }

  /// Every stored mutation, pending or failed, oldest first.
  pub fn list_all(&self) -> Result<Vec<QueuedMutation>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM queued_mutations m ORDER BY m.created_at ASC, m.id ASC",
        MUTATION_COLUMNS
      );
      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let all = stmt
        .query_map([], mutation_from_row)
        .map_err(|e| eyre!("Failed to query queue: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;
      Ok(all)
    })
  }

  /// All pending mutations with their replay bookkeeping, oldest first.
  pub fn list_pending(&self) -> Result<Vec<PendingMutation>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {}, ra.attempts, ra.next_attempt_at
         FROM queued_mutations m
         LEFT JOIN replay_attempts ra ON ra.mutation_id = m.id
         WHERE ra.failed_at IS NULL
         ORDER BY m.created_at ASC, m.id ASC",
        MUTATION_COLUMNS
      );
      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], |row| {
          let mutation = mutation_from_row(row)?;
          let attempts: Option<u32> = row.get(7)?;
          let next_attempt_at: Option<i64> = row.get(8)?;
          Ok(PendingMutation {
            mutation,
            attempt: AttemptState {
              attempts: attempts.unwrap_or(0),
              next_attempt_at,
            },
          })
        })
        .map_err(|e| eyre!("Failed to query queue: {}", e))?;

      let pending = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;
      Ok(pending)
    })
  }

  /// Delete one mutation after it was replayed successfully.
  pub fn remove(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let deleted = conn
        .execute("DELETE FROM queued_mutations WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
      Ok(deleted > 0)
    })
  }

  /// Number of pending mutations.
  pub fn count(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT COUNT(*) FROM queued_mutations m
           LEFT JOIN replay_attempts ra ON ra.mutation_id = m.id
           WHERE ra.failed_at IS NULL",
          [],
          |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count queue: {}", e))
    })
  }

  /// Number of mutations in the terminal failed state.
  pub fn failed_count(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT COUNT(*) FROM replay_attempts WHERE failed_at IS NOT NULL",
          [],
          |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count failed mutations: {}", e))
    })
  }

  /// Record a failed replay that will be retried.
  pub fn record_failure(
    &self,
    id: i64,
    attempts: u32,
    next_attempt_at: i64,
    error: &str,
  ) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO replay_attempts (mutation_id, attempts, next_attempt_at, last_error, failed_at)
           VALUES (?, ?, ?, ?, NULL)
           ON CONFLICT(mutation_id) DO UPDATE SET
             attempts = excluded.attempts,
             next_attempt_at = excluded.next_attempt_at,
             last_error = excluded.last_error",
          params![id, attempts, next_attempt_at, error],
        )
        .map_err(|e| eyre!("Failed to record attempt for mutation {}: {}", id, e))?;
      Ok(())
    })
  }

  /// Move a mutation to the terminal failed state.
  pub fn mark_failed(&self, id: i64, attempts: u32, error: &str, now_ms: i64) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO replay_attempts (mutation_id, attempts, next_attempt_at, last_error, failed_at)
           VALUES (?, ?, NULL, ?, ?)
           ON CONFLICT(mutation_id) DO UPDATE SET
             attempts = excluded.attempts,
             next_attempt_at = NULL,
             last_error = excluded.last_error,
             failed_at = excluded.failed_at",
          params![id, attempts, error, now_ms],
        )
        .map_err(|e| eyre!("Failed to mark mutation {} failed: {}", id, e))?;
      Ok(())
    })
  }

  /// Mutations the retry policy gave up on, oldest first.
  pub fn list_failed(&self) -> Result<Vec<FailedMutation>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {}, ra.attempts, ra.last_error, ra.failed_at
         FROM queued_mutations m
         INNER JOIN replay_attempts ra ON ra.mutation_id = m.id
         WHERE ra.failed_at IS NOT NULL
         ORDER BY m.created_at ASC, m.id ASC",
        MUTATION_COLUMNS
      );
      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], |row| {
          Ok(FailedMutation {
            mutation: mutation_from_row(row)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            failed_at: row.get(9)?,
          })
        })
        .map_err(|e| eyre!("Failed to query failed mutations: {}", e))?;

      let failed = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read failed mutation: {}", e))?;
      Ok(failed)
    })
  }

  /// Return a failed mutation to the pending queue with a fresh attempt
  /// budget. It keeps its original position.
  pub fn retry_failed(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let reset = conn
        .execute(
          "DELETE FROM replay_attempts WHERE mutation_id = ? AND failed_at IS NOT NULL",
          params![id],
        )
        .map_err(|e| eyre!("Failed to reset mutation {}: {}", id, e))?;
      Ok(reset > 0)
    })
  }

  /// Drop a failed mutation for good.
  pub fn discard(&self, id: i64) -> Result<bool> {
    self.db.with_conn(|conn| {
      let failed: Option<i64> = conn
        .query_row(
          "SELECT mutation_id FROM replay_attempts WHERE mutation_id = ? AND failed_at IS NOT NULL",
          params![id],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to look up mutation {}: {}", id, e))?;

      if failed.is_none() {
        return Ok(false);
      }

      conn
        .execute("DELETE FROM queued_mutations WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to discard mutation {}: {}", id, e))?;
      Ok(true)
    })
  }
}

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedMutation> {
  let headers_json: String = row.get(4)?;
  let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json).map_err(|e| {
    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
  })?;

  Ok(QueuedMutation {
    id: row.get(0)?,
    url: row.get(1)?,
    method: row.get(2)?,
    raw_body: row.get(3)?,
    headers,
    created_at: row.get(5)?,
    source: row.get(6)?,
  })
}
