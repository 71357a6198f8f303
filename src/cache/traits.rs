//! Core types for the response caches.

use chrono::{DateTime, Utc};

use crate::net::CapturedResponse;

/// The two independently versioned caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
  /// Bootstrap assets needed for an offline cold start
  Shell,
  /// Allow-listed API reads
  Api,
}

/// Current cache names, derived from configured versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub shell: String,
  pub api: String,
}

impl CacheNames {
  pub fn new(shell_version: &str, api_version: &str) -> Self {
    Self {
      shell: format!("pacer-shell-{}", shell_version),
      api: format!("pacer-api-{}", api_version),
    }
  }

  pub fn name(&self, namespace: CacheNamespace) -> &str {
    match namespace {
      CacheNamespace::Shell => &self.shell,
      CacheNamespace::Api => &self.api,
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.shell || name == self.api
  }
}

/// A response read back from a cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: CapturedResponse,
  pub cached_at: DateTime<Utc>,
}

/// Result of a network-first fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: CapturedResponse,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(response: CapturedResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, serving cached data
  Offline,
}
