use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Messages exchanged between the background worker and foreground views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  /// The number of pending mutations changed
  OfflineQueueUpdated {
    #[serde(rename = "queueCount")]
    queue_count: usize,
  },
  /// Foreground asks the background worker to drain the queue
  FlushOfflineQueue,
  /// A drain applied at least one mutation
  OfflineQueueFlushed {
    #[serde(rename = "flushedCount")]
    flushed_count: usize,
  },
  /// A mutation exhausted its retries and needs the user's attention
  OfflineMutationFailed {
    id: i64,
    method: String,
    url: String,
    attempts: u32,
  },
}

/// Events surfaced to the UI by the connectivity monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
  /// One-time confirmation that queued writes reached the server
  Flushed(usize),
  /// A queued write was given up on
  MutationFailed { id: i64, method: String, url: String },
}

/// Broadcast channel shared by every context.
#[derive(Clone)]
pub struct Notifier {
  tx: broadcast::Sender<Message>,
}

impl Notifier {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Publish to every subscriber. Having none is fine.
  pub fn publish(&self, message: Message) {
    let _ = self.tx.send(message);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Message> {
    self.tx.subscribe()
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new(64)
  }
}
