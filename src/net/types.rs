//! Request and response values passed between the application, the
//! interceptor and the network.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// An outbound request with its body already read as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  /// Always uppercase
  pub method: String,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl HttpRequest {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// Build a request from a method and a path relative to `base`.
  pub fn relative(method: &str, base: &Url, path: &str) -> Result<Self> {
    let url = base
      .join(path)
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))?;
    Ok(Self::new(method, url))
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_lowercase(), value.into());
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }
}

/// Header names are case-insensitive; stored and merged maps use lowercase keys.
pub fn normalize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
  headers
    .iter()
    .map(|(name, value)| (name.to_lowercase(), value.clone()))
    .collect()
}

/// A fully buffered response, as returned by the network or the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl CapturedResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  /// A synthetic JSON response.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut resp = Self::new(status, value.to_string());
    resp
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    resp
  }

  /// Returned in place of a mutation that was written to the offline queue.
  pub fn queued() -> Self {
    Self::json(202, &serde_json::json!({ "queued": true, "offline": true }))
  }

  /// Returned for a cacheable read with no network and no cached copy.
  pub fn offline_miss() -> Self {
    Self::json(
      503,
      &serde_json::json!({ "error": "Offline and no cached data available" }),
    )
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_is_uppercased() {
    let req = HttpRequest::new("post", Url::parse("http://localhost/api/runs").unwrap());
    assert_eq!(req.method, "POST");
  }

  #[test]
  fn test_relative_join() {
    let base = Url::parse("https://pacer.example/").unwrap();
    let req = HttpRequest::relative("get", &base, "/api/user").unwrap();
    assert_eq!(req.url.as_str(), "https://pacer.example/api/user");
    assert_eq!(req.path(), "/api/user");
  }

  #[test]
  fn test_normalize_headers_lowercases_names() {
    let headers = BTreeMap::from([
      ("Authorization".to_string(), "Bearer a".to_string()),
      ("X-Trace".to_string(), "1".to_string()),
    ]);
    let normalized = normalize_headers(&headers);
    assert_eq!(normalized.get("authorization").map(String::as_str), Some("Bearer a"));
    assert_eq!(normalized.get("x-trace").map(String::as_str), Some("1"));
    assert!(!normalized.contains_key("Authorization"));
  }

  #[test]
  fn test_synthetic_bodies() {
    let queued: serde_json::Value = serde_json::from_slice(&CapturedResponse::queued().body).unwrap();
    assert_eq!(queued, serde_json::json!({ "queued": true, "offline": true }));
    assert_eq!(CapturedResponse::queued().status, 202);

    let miss = CapturedResponse::offline_miss();
    assert_eq!(miss.status, 503);
    assert!(!miss.is_success());
    assert!(miss.text().contains("Offline and no cached data available"));
  }
}
