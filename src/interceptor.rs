//! Routes every outbound request to the network, the caches or the
//! offline queue.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheNamespace, CacheSource, CacheStorage};
use crate::config::Config;
use crate::event::{Message, Notifier};
use crate::net::{CapturedResponse, HttpRequest, Transport};
use crate::queue::{NewMutation, QueueStore};

/// Source tag stored on mutations captured here.
pub const INTERCEPTOR_SOURCE: &str = "interceptor";

const MUTATING_METHODS: &[&str] = &["POST", "PUT", "PATCH"];

/// Which strategy applies to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// POST/PUT/PATCH under the API namespace: queued when offline
  Mutation,
  /// GET under an allow-listed prefix: API cache fallback
  CacheableRead,
  /// Everything else: shell cache fallback
  Static,
}

/// Path rules used to classify requests.
#[derive(Debug, Clone)]
pub struct Routes {
  pub api_prefix: String,
  pub cacheable_prefixes: Vec<String>,
  pub shell_document: Url,
}

impl Routes {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let shell_document = config
      .api
      .base_url
      .join(&config.cache.shell_document)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid shell document path: {}", e))?;

    Ok(Self {
      api_prefix: config.api.prefix.clone(),
      cacheable_prefixes: config.api.cacheable_prefixes.clone(),
      shell_document,
    })
  }

  pub fn classify(&self, request: &HttpRequest) -> RequestClass {
    let path = request.path();
    let method = request.method.as_str();

    if MUTATING_METHODS.contains(&method) && path.starts_with(&self.api_prefix) {
      RequestClass::Mutation
    } else if method == "GET"
      && self
        .cacheable_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
      RequestClass::CacheableRead
    } else {
      RequestClass::Static
    }
  }
}

/// Outcome of an intercepted request.
///
/// A queued write is never reported as applied: callers match on the
/// variant instead of inspecting a status code.
#[derive(Debug, Clone)]
pub enum Intercepted {
  /// The network answered (any status)
  Applied(CapturedResponse),
  /// The network was unreachable and a cached copy was served
  Stale {
    response: CapturedResponse,
    cached_at: DateTime<Utc>,
  },
  /// The write was stored in the offline queue and will be replayed
  Queued { id: i64, response: CapturedResponse },
  /// Nothing could answer the request
  Failed {
    reason: String,
    response: Option<CapturedResponse>,
  },
}

impl Intercepted {
  /// The HTTP-shaped response, including synthetic 202/503 bodies.
  pub fn response(&self) -> Option<&CapturedResponse> {
    match self {
      Intercepted::Applied(response)
      | Intercepted::Stale { response, .. }
      | Intercepted::Queued { response, .. } => Some(response),
      Intercepted::Failed { response, .. } => response.as_ref(),
    }
  }

  pub fn into_response(self) -> Option<CapturedResponse> {
    match self {
      Intercepted::Applied(response)
      | Intercepted::Stale { response, .. }
      | Intercepted::Queued { response, .. } => Some(response),
      Intercepted::Failed { response, .. } => response,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, Intercepted::Queued { .. })
  }
}

/// Sits between the application and the network.
pub struct Interceptor<T: Transport, S: CacheStorage> {
  transport: Arc<T>,
  cache: CacheLayer<S>,
  queue: QueueStore,
  notifier: Notifier,
  routes: Routes,
}

impl<T: Transport, S: CacheStorage> Interceptor<T, S> {
  pub fn new(
    transport: Arc<T>,
    cache: CacheLayer<S>,
    queue: QueueStore,
    notifier: Notifier,
    routes: Routes,
  ) -> Self {
    Self {
      transport,
      cache,
      queue,
      notifier,
      routes,
    }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn transport(&self) -> &T {
    self.transport.as_ref()
  }

  pub async fn handle(&self, request: HttpRequest) -> Intercepted {
    let class = self.routes.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "intercepted request");

    match class {
      RequestClass::Mutation => self.handle_mutation(request).await,
      RequestClass::CacheableRead => self.handle_read(request).await,
      RequestClass::Static => self.handle_static(request).await,
    }
  }

  async fn handle_mutation(&self, request: HttpRequest) -> Intercepted {
    let error = match self.transport.send(&request).await {
      Ok(response) => return Intercepted::Applied(response),
      Err(e) => e,
    };

    let mutation =
      NewMutation::from_request(&request, INTERCEPTOR_SOURCE, Utc::now().timestamp_millis());
    match self.queue.enqueue(&mutation) {
      Ok(id) => {
        info!(id, method = %request.method, url = %request.url, "queued mutation while offline");
        self.publish_count();
        Intercepted::Queued {
          id,
          response: CapturedResponse::queued(),
        }
      }
      Err(queue_error) => {
        // The write is lost; the caller sees the original network failure.
        warn!(error = %queue_error, url = %request.url, "offline queue unavailable");
        Intercepted::Failed {
          reason: error.to_string(),
          response: None,
        }
      }
    }
  }

  async fn handle_read(&self, request: HttpRequest) -> Intercepted {
    match self
      .cache
      .network_first(CacheNamespace::Api, &request, self.transport.as_ref())
      .await
    {
      Ok(result) => into_intercepted(result),
      Err(e) => Intercepted::Failed {
        reason: e.to_string(),
        response: Some(CapturedResponse::offline_miss()),
      },
    }
  }

  async fn handle_static(&self, request: HttpRequest) -> Intercepted {
    if request.method != "GET" {
      return match self.transport.send(&request).await {
        Ok(response) => Intercepted::Applied(response),
        Err(e) => Intercepted::Failed {
          reason: e.to_string(),
          response: None,
        },
      };
    }

    match self
      .cache
      .network_first(CacheNamespace::Shell, &request, self.transport.as_ref())
      .await
    {
      Ok(result) => into_intercepted(result),
      Err(e) => match self.cache.lookup(
        CacheNamespace::Shell,
        "GET",
        self.routes.shell_document.as_str(),
      ) {
        Some(shell) => {
          debug!(url = %request.url, "serving app shell while offline");
          Intercepted::Stale {
            response: shell.response,
            cached_at: shell.cached_at,
          }
        }
        None => Intercepted::Failed {
          reason: e.to_string(),
          response: None,
        },
      },
    }
  }

  fn publish_count(&self) {
    match self.queue.count() {
      Ok(queue_count) => self
        .notifier
        .publish(Message::OfflineQueueUpdated { queue_count }),
      Err(e) => warn!(error = %e, "failed to count offline queue"),
    }
  }
}

fn into_intercepted(result: crate::cache::CacheResult) -> Intercepted {
  match (result.source, result.cached_at) {
    (CacheSource::Offline, Some(cached_at)) => Intercepted::Stale {
      response: result.response,
      cached_at,
    },
    _ => Intercepted::Applied(result.response),
  }
}

impl<T: Transport, S: CacheStorage> Clone for Interceptor<T, S> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      notifier: self.notifier.clone(),
      routes: self.routes.clone(),
    }
  }
}
