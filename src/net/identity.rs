use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Source of authorization headers, consulted each time a request is sent.
pub trait Identity: Send + Sync + 'static {
  fn headers(&self) -> BTreeMap<String, String>;
}

/// Anonymous access; adds nothing.
pub struct NoIdentity;

impl Identity for NoIdentity {
  fn headers(&self) -> BTreeMap<String, String> {
    BTreeMap::new()
  }
}

/// Bearer token that can be rotated while the process runs.
#[derive(Clone, Default)]
pub struct TokenIdentity {
  token: Arc<RwLock<Option<String>>>,
}

impl TokenIdentity {
  pub fn new(token: Option<String>) -> Self {
    Self {
      token: Arc::new(RwLock::new(token)),
    }
  }

  pub fn rotate(&self, token: impl Into<String>) {
    if let Ok(mut guard) = self.token.write() {
      *guard = Some(token.into());
    }
  }
}

impl Identity for TokenIdentity {
  fn headers(&self) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Ok(guard) = self.token.read() {
      if let Some(token) = guard.as_deref() {
        headers.insert("authorization".to_string(), format!("Bearer {}", token));
      }
    }
    headers
  }
}
