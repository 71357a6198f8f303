use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::net::{normalize_headers, HttpRequest};

/// A mutating request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub url: String,
  pub method: String,
  pub raw_body: Option<String>,
  pub headers: BTreeMap<String, String>,
  /// Epoch milliseconds; primary ordering key
  pub created_at: i64,
  /// Which context captured the request (e.g. "interceptor")
  pub source: String,
}

/// A mutation that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub url: String,
  pub method: String,
  pub raw_body: Option<String>,
  pub headers: BTreeMap<String, String>,
  pub created_at: i64,
  pub source: String,
}

impl NewMutation {
  pub fn from_request(request: &HttpRequest, source: &str, created_at: i64) -> Self {
    Self {
      url: request.url.to_string(),
      method: request.method.to_uppercase(),
      raw_body: request.body.clone(),
      headers: normalize_headers(&request.headers),
      created_at,
      source: source.to_string(),
    }
  }
}

/// Replay bookkeeping for one mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptState {
  pub attempts: u32,
  /// Earliest epoch-ms at which a timer-driven replay may try again
  pub next_attempt_at: Option<i64>,
}

/// A queued mutation with its replay bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  pub mutation: QueuedMutation,
  pub attempt: AttemptState,
}

/// A mutation the retry policy gave up on. It stays stored until it is
/// retried or discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMutation {
  pub mutation: QueuedMutation,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub failed_at: i64,
}
