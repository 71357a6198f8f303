//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{CacheNames, CacheNamespace, CacheResult, CachedResponse};
use crate::net::{CapturedResponse, HttpRequest, Transport, TransportError};

/// Cache layer that manages caching logic and network fetching.
///
/// Network-first: a reachable network always wins, and only 2xx
/// responses replace a cached entry. A cached copy is served only when
/// the network cannot be reached.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  names: CacheNames,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S, names: CacheNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  /// Fetch through the network, falling back to the cache.
  ///
  /// 1. Send the request
  /// 2. On a 2xx response, store a copy (best effort) and return it
  /// 3. On any other response, return it untouched
  /// 4. On transport failure, return the cached copy if there is one
  pub async fn network_first<T: Transport>(
    &self,
    namespace: CacheNamespace,
    request: &HttpRequest,
    transport: &T,
  ) -> std::result::Result<CacheResult, TransportError> {
    match transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(namespace, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(namespace, &request.method, request.url.as_str()) {
        Some(cached) => {
          debug!(url = %request.url, "network unavailable, serving cached response");
          Ok(CacheResult::offline(cached))
        }
        None => Err(e),
      },
    }
  }

  /// Look up a cached response. Storage errors count as a miss.
  pub fn lookup(&self, namespace: CacheNamespace, method: &str, url: &str) -> Option<CachedResponse> {
    match self.storage.lookup(self.names.name(namespace), method, url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(error = %e, url, "cache lookup failed");
        None
      }
    }
  }

  /// Cache writes never fail the request that produced them.
  fn store(
    &self,
    namespace: CacheNamespace,
    request: &HttpRequest,
    response: &CapturedResponse,
  ) -> bool {
    let name = self.names.name(namespace);
    match self
      .storage
      .put(name, &request.method, request.url.as_str(), response)
    {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, cache = name, url = %request.url, "failed to store response");
        false
      }
    }
  }

  /// Delete every cache whose name is not one of the current versions.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.cache_names()? {
      if !self.names.is_current(&name) {
        let entries = self.storage.delete_cache(&name)?;
        info!(cache = %name, entries, "deleted outdated cache");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Fetch each shell asset and store the successful ones. Returns how
  /// many were stored.
  pub async fn precache<T: Transport>(&self, assets: &[HttpRequest], transport: &T) -> usize {
    let mut stored = 0;
    for request in assets {
      match transport.send(request).await {
        Ok(response) if response.is_success() => {
          if self.store(CacheNamespace::Shell, request, &response) {
            stored += 1;
          }
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "shell asset not cached");
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "shell asset unreachable");
        }
      }
    }
    stored
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}
