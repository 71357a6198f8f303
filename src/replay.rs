//! Replays queued mutations, oldest first, once the network is back.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::connectivity::Connectivity;
use crate::event::{Message, Notifier};
use crate::net::{normalize_headers, HttpRequest, Identity, Transport};
use crate::queue::{PendingMutation, QueueStore, RetryDecision, RetryPolicy};

/// Why a drain was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  /// Offline to online transition
  Reconnected,
  /// A foreground view mounted while online
  Mounted,
  /// Explicit flush request from another context
  Requested,
  /// Periodic retry while online; honours backoff
  RetryTimer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Mutations applied and removed
  pub flushed: usize,
  /// Pending mutations left after the drain
  pub remaining: usize,
  /// The mutation the drain stopped at, if it did not finish
  pub stopped_at: Option<i64>,
  /// Mutations moved to the failed state during this drain
  pub gave_up: Vec<i64>,
  /// The drain did not run because the platform reports offline
  pub offline: bool,
}

/// Sequentially replays the queue.
///
/// A record is only removed after a 2xx response. The first failure ends
/// the drain so a later mutation is never applied ahead of an earlier one.
pub struct ReplayEngine<T: Transport> {
  transport: Arc<T>,
  identity: Arc<dyn Identity>,
  queue: QueueStore,
  notifier: Notifier,
  connectivity: Connectivity,
  policy: RetryPolicy,
}

enum Attempt {
  Applied,
  Rejected(String),
}

impl<T: Transport> ReplayEngine<T> {
  pub fn new(
    transport: Arc<T>,
    identity: Arc<dyn Identity>,
    queue: QueueStore,
    notifier: Notifier,
    connectivity: Connectivity,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      transport,
      identity,
      queue,
      notifier,
      connectivity,
      policy,
    }
  }

  pub async fn drain(&self, trigger: DrainTrigger) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    if !self.connectivity.is_online() {
      report.offline = true;
      return Ok(report);
    }

    let pending = self.queue.list_pending()?;
    if pending.is_empty() {
      self.notifier.publish(Message::OfflineQueueUpdated { queue_count: 0 });
      return Ok(report);
    }
    debug!(?trigger, pending = pending.len(), "draining offline queue");

    for entry in &pending {
      let id = entry.mutation.id;

      if trigger == DrainTrigger::RetryTimer {
        if let Some(next) = entry.attempt.next_attempt_at {
          if next > Utc::now().timestamp_millis() {
            report.stopped_at = Some(id);
            break;
          }
        }
      }

      match self.replay_one(entry).await {
        Attempt::Applied => {
          if let Err(e) = self.queue.remove(id) {
            warn!(id, error = %e, "replayed mutation could not be removed");
            report.stopped_at = Some(id);
            break;
          }
          report.flushed += 1;
        }
        Attempt::Rejected(reason) => {
          debug!(id, %reason, "replay failed, stopping drain");
          match self.record_failure(entry, &reason) {
            Ok(true) => report.gave_up.push(id),
            Ok(false) => {}
            Err(e) => warn!(id, error = %e, "failed to record replay failure"),
          }
          report.stopped_at = Some(id);
          break;
        }
      }
    }

    report.remaining = self.queue.count()?;
    self.notifier.publish(Message::OfflineQueueUpdated {
      queue_count: report.remaining,
    });
    if report.flushed > 0 {
      info!(flushed = report.flushed, remaining = report.remaining, "flushed offline queue");
      self.notifier.publish(Message::OfflineQueueFlushed {
        flushed_count: report.flushed,
      });
    }

    Ok(report)
  }

  async fn replay_one(&self, entry: &PendingMutation) -> Attempt {
    let mutation = &entry.mutation;
    let url = match Url::parse(&mutation.url) {
      Ok(url) => url,
      Err(e) => return Attempt::Rejected(format!("invalid url: {}", e)),
    };

    let mut request = HttpRequest::new(&mutation.method, url);
    request.headers = normalize_headers(&mutation.headers);
    // Credentials are taken as of now, not as captured.
    request.headers.extend(normalize_headers(&self.identity.headers()));
    request.body = mutation.raw_body.clone();

    match self.transport.send(&request).await {
      Ok(response) if response.is_success() => Attempt::Applied,
      Ok(response) => Attempt::Rejected(format!("status {}", response.status)),
      Err(e) => Attempt::Rejected(e.to_string()),
    }
  }

  /// Returns true if the mutation moved to the failed state.
  fn record_failure(&self, entry: &PendingMutation, reason: &str) -> Result<bool> {
    let id = entry.mutation.id;
    let attempts = entry.attempt.attempts + 1;
    let now = Utc::now().timestamp_millis();

    match self.policy.on_failure(attempts, now) {
      RetryDecision::RetryAt(next) => {
        self.queue.record_failure(id, attempts, next, reason)?;
        Ok(false)
      }
      RetryDecision::GiveUp => {
        self.queue.mark_failed(id, attempts, reason, now)?;
        warn!(id, attempts, %reason, "giving up on queued mutation");
        self.notifier.publish(Message::OfflineMutationFailed {
          id,
          method: entry.mutation.method.clone(),
          url: entry.mutation.url.clone(),
          attempts,
        });
        Ok(true)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::net::client::fake::FakeTransport;
  use crate::net::{CapturedResponse, NoIdentity, TokenIdentity};
  use crate::queue::NewMutation;
  use std::collections::BTreeMap;
  use std::time::Duration;
  use tokio::sync::broadcast;

  struct Harness {
    engine: ReplayEngine<FakeTransport>,
    transport: FakeTransport,
    queue: QueueStore,
    connectivity: Connectivity,
    rx: broadcast::Receiver<Message>,
  }

  fn harness_with(identity: Arc<dyn Identity>, policy: RetryPolicy) -> Harness {
    let queue = QueueStore::new(Database::open_in_memory().unwrap());
    let transport = FakeTransport::new();
    transport.set_fallback(CapturedResponse::new(200, "{}"));
    let notifier = Notifier::default();
    let rx = notifier.subscribe();
    let connectivity = Connectivity::new(true);
    let engine = ReplayEngine::new(
      Arc::new(transport.clone()),
      identity,
      queue.clone(),
      notifier,
      connectivity.clone(),
      policy,
    );
    Harness {
      engine,
      transport,
      queue,
      connectivity,
      rx,
    }
  }

  fn harness() -> Harness {
    harness_with(Arc::new(NoIdentity), RetryPolicy::default())
  }

  fn enqueue(queue: &QueueStore, n: i64) -> i64 {
    queue
      .enqueue(&NewMutation {
        url: format!("https://pacer.example/api/runs/{}", n),
        method: "POST".to_string(),
        raw_body: Some(format!("{{\"n\":{}}}", n)),
        headers: BTreeMap::from([("authorization".to_string(), "Bearer stale".to_string())]),
        created_at: n,
        source: "test".to_string(),
      })
      .unwrap()
  }

  fn drain_messages(rx: &mut broadcast::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
      out.push(msg);
    }
    out
  }

  #[tokio::test]
  async fn test_replays_in_original_order() {
    let mut h = harness();
    for n in 1..=3 {
      enqueue(&h.queue, n);
    }

    let report = h.engine.drain(DrainTrigger::Reconnected).await.unwrap();
    assert_eq!(report.flushed, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.stopped_at, None);

    let paths: Vec<String> = h.transport.sent().iter().map(|r| r.path().to_string()).collect();
    assert_eq!(paths, vec!["/api/runs/1", "/api/runs/2", "/api/runs/3"]);
    assert_eq!(h.transport.sent()[0].body.as_deref(), Some("{\"n\":1}"));

    assert_eq!(
      drain_messages(&mut h.rx),
      vec![
        Message::OfflineQueueUpdated { queue_count: 0 },
        Message::OfflineQueueFlushed { flushed_count: 3 },
      ]
    );
  }

  #[tokio::test]
  async fn test_stops_at_first_failure_and_resumes_there() {
    let h = harness();
    let ids: Vec<i64> = (1..=5).map(|n| enqueue(&h.queue, n)).collect();
    h.transport.push(Ok(CapturedResponse::new(200, "")));
    h.transport.push(Ok(CapturedResponse::new(201, "")));
    h.transport.push(Ok(CapturedResponse::new(500, "")));

    let report = h.engine.drain(DrainTrigger::Reconnected).await.unwrap();
    assert_eq!(report.flushed, 2);
    assert_eq!(report.remaining, 3);
    assert_eq!(report.stopped_at, Some(ids[2]));
    assert_eq!(h.transport.sent().len(), 3);

    let remaining: Vec<i64> = h.queue.list_all().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(remaining, ids[2..].to_vec());

    for _ in 0..3 {
      h.transport.push(Ok(CapturedResponse::new(200, "")));
    }
    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert_eq!(report.flushed, 3);

    let paths: Vec<String> = h.transport.sent()[3..]
      .iter()
      .map(|r| r.path().to_string())
      .collect();
    assert_eq!(paths, vec!["/api/runs/3", "/api/runs/4", "/api/runs/5"]);
  }

  #[tokio::test]
  async fn test_network_error_keeps_record() {
    let h = harness();
    let id = enqueue(&h.queue, 1);
    h.transport.push(Err(()));

    let report = h.engine.drain(DrainTrigger::Reconnected).await.unwrap();
    assert_eq!(report.flushed, 0);
    assert_eq!(report.stopped_at, Some(id));

    let pending = h.queue.list_pending().unwrap();
    assert_eq!(pending[0].attempt.attempts, 1);
    assert!(pending[0].attempt.next_attempt_at.is_some());
  }

  #[tokio::test]
  async fn test_empty_queue_makes_no_calls() {
    let mut h = harness();

    let report = h.engine.drain(DrainTrigger::Mounted).await.unwrap();
    assert_eq!(report, DrainReport::default());
    assert!(h.transport.sent().is_empty());

    let messages = drain_messages(&mut h.rx);
    assert!(!messages
      .iter()
      .any(|m| matches!(m, Message::OfflineQueueFlushed { .. })));
  }

  #[tokio::test]
  async fn test_offline_returns_immediately() {
    let h = harness();
    enqueue(&h.queue, 1);
    h.connectivity.set_online(false);

    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert!(report.offline);
    assert_eq!(report.flushed, 0);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.queue.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_replay_uses_current_credentials() {
    let identity = TokenIdentity::new(Some("fresh".to_string()));
    let h = harness_with(Arc::new(identity), RetryPolicy::default());
    enqueue(&h.queue, 1);

    h.engine.drain(DrainTrigger::Reconnected).await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(
      sent[0].headers.get("authorization").map(String::as_str),
      Some("Bearer fresh")
    );
  }

  #[tokio::test]
  async fn test_capitalised_captured_authorization_is_replaced() {
    let identity = TokenIdentity::new(Some("fresh".to_string()));
    let h = harness_with(Arc::new(identity), RetryPolicy::default());
    h.queue
      .enqueue(&NewMutation {
        url: "https://pacer.example/api/runs/1".to_string(),
        method: "POST".to_string(),
        raw_body: None,
        headers: BTreeMap::from([("Authorization".to_string(), "Bearer stale".to_string())]),
        created_at: 1,
        source: "test".to_string(),
      })
      .unwrap();
    // A row written with mixed-case names, bypassing enqueue.
    h.queue
      .database()
      .with_conn(|conn| {
        conn
          .execute(
            "INSERT INTO queued_mutations (url, method, raw_body, headers, created_at, source)
             VALUES ('https://pacer.example/api/runs/2', 'POST', NULL,
                     '{\"AUTHORIZATION\":\"Bearer stale\"}', 2, 'test')",
            [],
          )
          .map_err(|e| color_eyre::eyre::eyre!("{}", e))
      })
      .unwrap();

    h.engine.drain(DrainTrigger::Reconnected).await.unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    for request in &sent {
      let auth: Vec<&String> = request
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value)
        .collect();
      assert_eq!(auth, vec!["Bearer fresh"]);
    }
  }

  #[tokio::test]
  async fn test_failed_bookkeeping_write_still_publishes_count() {
    let mut h = harness();
    let id = enqueue(&h.queue, 1);
    h.queue
      .database()
      .with_conn(|conn| {
        conn
          .execute_batch(
            "CREATE TRIGGER reject_attempts BEFORE INSERT ON replay_attempts
             BEGIN SELECT RAISE(ABORT, 'attempts are read-only'); END;",
          )
          .map_err(|e| color_eyre::eyre::eyre!("{}", e))
      })
      .unwrap();
    h.transport.push(Ok(CapturedResponse::new(500, "")));

    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert_eq!(report.stopped_at, Some(id));
    assert_eq!(report.remaining, 1);
    assert!(report.gave_up.is_empty());
    assert_eq!(
      drain_messages(&mut h.rx),
      vec![Message::OfflineQueueUpdated { queue_count: 1 }]
    );
  }

  #[tokio::test]
  async fn test_retry_timer_respects_backoff() {
    let h = harness();
    enqueue(&h.queue, 1);
    h.transport.push(Err(()));
    h.engine.drain(DrainTrigger::Reconnected).await.unwrap();

    let report = h.engine.drain(DrainTrigger::RetryTimer).await.unwrap();
    assert_eq!(report.flushed, 0);
    assert!(report.stopped_at.is_some());
    assert_eq!(h.transport.sent().len(), 1);

    // Explicit triggers go ahead regardless.
    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert_eq!(report.flushed, 1);
  }

  #[tokio::test]
  async fn test_gives_up_after_max_attempts() {
    let policy = RetryPolicy {
      max_attempts: 2,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(1),
    };
    let mut h = harness_with(Arc::new(NoIdentity), policy);
    let first = enqueue(&h.queue, 1);
    let second = enqueue(&h.queue, 2);
    h.transport.push(Ok(CapturedResponse::new(422, "")));
    h.transport.push(Ok(CapturedResponse::new(422, "")));

    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert!(report.gave_up.is_empty());
    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert_eq!(report.gave_up, vec![first]);
    assert_eq!(report.remaining, 1);

    let failed = h.queue.list_failed().unwrap();
    assert_eq!(failed[0].mutation.id, first);
    assert_eq!(failed[0].last_error.as_deref(), Some("status 422"));
    assert!(drain_messages(&mut h.rx)
      .iter()
      .any(|m| matches!(m, Message::OfflineMutationFailed { id, attempts: 2, .. } if *id == first)));

    // The next mutation is no longer blocked.
    let report = h.engine.drain(DrainTrigger::Requested).await.unwrap();
    assert_eq!(report.flushed, 1);
    assert!(h.queue.list_all().unwrap().iter().all(|m| m.id != second));
  }
}
