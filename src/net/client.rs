use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::types::{CapturedResponse, HttpRequest};

/// Failure to obtain any response at all.
///
/// An HTTP error status is not a transport error; it comes back as a
/// [`CapturedResponse`].
#[derive(Debug, Error)]
pub enum TransportError {
  /// Connection refused, DNS failure, timeout, reset
  #[error("network unreachable: {0}")]
  Unreachable(String),
  /// The request could not be built or the body could not be read
  #[error("request failed: {0}")]
  Other(String),
}

impl TransportError {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, TransportError::Unreachable(_))
  }
}

/// The network seam. Everything above it only sees buffered responses.
pub trait Transport: Send + Sync + 'static {
  fn send<'a>(
    &'a self,
    request: &'a HttpRequest,
  ) -> BoxFuture<'a, Result<CapturedResponse, TransportError>>;
}

/// Production transport over reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn execute(&self, request: &HttpRequest) -> Result<CapturedResponse, TransportError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| TransportError::Other(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(classify_error)?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(classify_error)?.to_vec();

    Ok(CapturedResponse {
      status,
      headers,
      body,
    })
  }
}

impl Transport for ReqwestTransport {
  fn send<'a>(
    &'a self,
    request: &'a HttpRequest,
  ) -> BoxFuture<'a, Result<CapturedResponse, TransportError>> {
    Box::pin(self.execute(request))
  }
}

fn classify_error(e: reqwest::Error) -> TransportError {
  if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
    TransportError::Unreachable(e.to_string())
  } else {
    TransportError::Other(e.to_string())
  }
}

#[cfg(test)]
pub mod fake {
  //! Scripted transport used by the tests across the crate.

  use super::*;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::{Arc, Mutex};

  #[derive(Clone, Default)]
  pub struct FakeTransport {
    offline: Arc<AtomicBool>,
    routes: Arc<Mutex<BTreeMap<(String, String), CapturedResponse>>>,
    scripted: Arc<Mutex<VecDeque<Result<CapturedResponse, ()>>>>,
    fallback: Arc<Mutex<Option<CapturedResponse>>>,
    sent: Arc<Mutex<Vec<HttpRequest>>>,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fixed response for a method and path.
    pub fn route(&self, method: &str, path: &str, response: CapturedResponse) {
      self
        .routes
        .lock()
        .unwrap()
        .insert((method.to_string(), path.to_string()), response);
    }

    /// One-shot outcomes consumed in order before routes are consulted.
    /// `Err(())` is a connectivity failure.
    pub fn push(&self, outcome: Result<CapturedResponse, ()>) {
      self.scripted.lock().unwrap().push_back(outcome);
    }

    /// Response for requests with no route (404 if unset).
    pub fn set_fallback(&self, response: CapturedResponse) {
      *self.fallback.lock().unwrap() = Some(response);
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
      self.sent.lock().unwrap().clone()
    }
  }

  impl Transport for FakeTransport {
    fn send<'a>(
      &'a self,
      request: &'a HttpRequest,
    ) -> BoxFuture<'a, Result<CapturedResponse, TransportError>> {
      Box::pin(async move {
        if self.offline.load(Ordering::SeqCst) {
          return Err(TransportError::Unreachable("offline".to_string()));
        }
        self.sent.lock().unwrap().push(request.clone());

        if let Some(outcome) = self.scripted.lock().unwrap().pop_front() {
          return outcome.map_err(|_| TransportError::Unreachable("scripted".to_string()));
        }

        let key = (request.method.clone(), request.path().to_string());
        Ok(
          self
            .routes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or_else(|| CapturedResponse::new(404, "not found")),
        )
      })
    }
  }
}
