//! Platform online/offline signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::net::{HttpRequest, Transport};

/// Shared online flag. Every clone observes the same value.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Decides reachability by polling a health endpoint. Any response, even
/// an error status, means the network is up.
pub struct ConnectivityProbe<T: Transport> {
  transport: Arc<T>,
  connectivity: Connectivity,
  request: HttpRequest,
  interval: Duration,
}

impl<T: Transport> ConnectivityProbe<T> {
  pub fn new(
    transport: Arc<T>,
    connectivity: Connectivity,
    request: HttpRequest,
    interval: Duration,
  ) -> Self {
    Self {
      transport,
      connectivity,
      request,
      interval,
    }
  }

  /// Probe once and update the shared flag. Returns the observed state.
  pub async fn probe_once(&self) -> bool {
    let online = match self.transport.send(&self.request).await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "health probe failed");
        false
      }
    };
    self.connectivity.set_online(online);
    online
  }

  /// Probe forever at the configured interval.
  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      self.probe_once().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::client::fake::FakeTransport;
  use crate::net::CapturedResponse;
  use url::Url;

  #[test]
  fn test_set_online_reports_changes() {
    let connectivity = Connectivity::new(false);
    let rx = connectivity.subscribe();

    assert!(connectivity.set_online(true));
    assert!(!connectivity.set_online(true));
    assert!(connectivity.is_online());
    assert!(*rx.borrow());
  }

  #[tokio::test]
  async fn test_probe_treats_any_response_as_online() {
    let transport = FakeTransport::new();
    transport.route("GET", "/api/health", CapturedResponse::new(503, "maintenance"));
    let connectivity = Connectivity::new(false);
    let probe = ConnectivityProbe::new(
      Arc::new(transport.clone()),
      connectivity.clone(),
      HttpRequest::get(Url::parse("https://pacer.example/api/health").unwrap()),
      Duration::from_secs(1),
    );

    assert!(probe.probe_once().await);
    assert!(connectivity.is_online());

    transport.set_offline(true);
    assert!(!probe.probe_once().await);
    assert!(!connectivity.is_online());
  }
}
