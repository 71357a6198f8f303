//! Foreground observer of connectivity and queue changes.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::connectivity::Connectivity;
use crate::event::{Message, Notifier, UiEvent};
use crate::net::Transport;
use crate::queue::QueueStore;
use crate::replay::DrainTrigger;
use crate::worker::WorkerHandle;

/// What the UI shows. Recomputed on every change, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub queue_count: usize,
}

/// Receiving side handed to the UI.
pub struct MonitorView {
  pub state: watch::Receiver<ConnectivityState>,
  pub events: mpsc::UnboundedReceiver<UiEvent>,
}

pub struct ConnectivityMonitor<T: Transport, S: CacheStorage> {
  inner: Inner<T, S>,
  online_rx: watch::Receiver<bool>,
  messages: broadcast::Receiver<Message>,
}

struct Inner<T: Transport, S: CacheStorage> {
  worker: WorkerHandle<T, S>,
  queue: QueueStore,
  connectivity: Connectivity,
  state: watch::Sender<ConnectivityState>,
  events: mpsc::UnboundedSender<UiEvent>,
}

impl<T: Transport, S: CacheStorage> ConnectivityMonitor<T, S> {
  pub fn new(
    worker: WorkerHandle<T, S>,
    queue: QueueStore,
    connectivity: Connectivity,
    notifier: Notifier,
  ) -> (Self, MonitorView) {
    let initial = ConnectivityState {
      is_online: connectivity.is_online(),
      queue_count: queue.count().unwrap_or(0),
    };
    let (state, state_rx) = watch::channel(initial);
    let (events, events_rx) = mpsc::unbounded_channel();

    // Subscribe up front so nothing published before `run` is missed.
    let monitor = Self {
      online_rx: connectivity.subscribe(),
      messages: notifier.subscribe(),
      inner: Inner {
        worker,
        queue,
        connectivity,
        state,
        events,
      },
    };
    let view = MonitorView {
      state: state_rx,
      events: events_rx,
    };
    (monitor, view)
  }

  /// Observe until the connectivity signal and the notifier both go away.
  pub async fn run(self) {
    let Self {
      inner,
      mut online_rx,
      mut messages,
    } = self;
    let mut was_online = *online_rx.borrow_and_update();

    // Covers a reload with a non-empty queue.
    inner.refresh();
    if was_online {
      inner.flush(DrainTrigger::Mounted).await;
    }

    loop {
      tokio::select! {
        changed = online_rx.changed() => {
          if changed.is_err() {
            break;
          }
          let online = *online_rx.borrow_and_update();
          if online && !was_online {
            debug!("back online, requesting flush");
            inner.flush(DrainTrigger::Reconnected).await;
          } else {
            inner.refresh();
          }
          was_online = online;
        }
        message = messages.recv() => match message {
          Ok(message) => inner.on_message(message),
          Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "monitor lagged behind notifications");
            inner.refresh();
          }
          Err(RecvError::Closed) => break,
        },
      }
    }
  }
}

impl<T: Transport, S: CacheStorage> Inner<T, S> {
  async fn flush(&self, trigger: DrainTrigger) {
    if let Err(e) = self.worker.flush(trigger).await {
      warn!(?trigger, error = %e, "flush request failed");
    }
    self.refresh();
  }

  fn on_message(&self, message: Message) {
    match message {
      Message::OfflineQueueUpdated { .. } => self.refresh(),
      Message::OfflineQueueFlushed { flushed_count } => {
        self.refresh();
        let _ = self.events.send(UiEvent::Flushed(flushed_count));
      }
      Message::OfflineMutationFailed { id, method, url, .. } => {
        self.refresh();
        let _ = self.events.send(UiEvent::MutationFailed { id, method, url });
      }
      Message::FlushOfflineQueue => {}
    }
  }

  /// Re-read the count from the store; it is never tracked separately.
  fn refresh(&self) {
    let is_online = self.connectivity.is_online();
    match self.queue.count() {
      Ok(queue_count) => {
        self.state.send_replace(ConnectivityState {
          is_online,
          queue_count,
        });
      }
      Err(e) => {
        warn!(error = %e, "failed to read queue count");
        self.state.send_modify(|s| s.is_online = is_online);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interceptor::Intercepted;
  use crate::net::{CapturedResponse, HttpRequest};
  use crate::worker::tests::{base, setup};
  use std::time::Duration;

  async fn wait_for(
    rx: &mut watch::Receiver<ConnectivityState>,
    predicate: impl Fn(&ConnectivityState) -> bool,
  ) -> ConnectivityState {
    tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        let current = *rx.borrow_and_update();
        if predicate(&current) {
          return current;
        }
        rx.changed().await.unwrap();
      }
    })
    .await
    .expect("state never matched")
  }

  fn post_run() -> HttpRequest {
    HttpRequest::relative("POST", &base(), "/api/runs")
      .unwrap()
      .with_body("{\"km\":3}")
  }

  #[tokio::test]
  async fn test_mount_while_online_flushes_leftover_queue() {
    let s = setup(Duration::from_secs(3600));
    s.transport.route("POST", "/api/runs", CapturedResponse::new(201, ""));
    s.transport.set_offline(true);
    let (handle, _join) = s.worker.spawn();
    handle.handle(post_run()).await;
    s.transport.set_offline(false);

    let (monitor, mut view) =
      ConnectivityMonitor::new(handle, s.queue.clone(), s.connectivity.clone(), s.notifier.clone());
    tokio::spawn(monitor.run());

    let state = wait_for(&mut view.state, |st| st.is_online && st.queue_count == 0).await;
    assert_eq!(state.queue_count, 0);
    let event = tokio::time::timeout(Duration::from_secs(5), view.events.recv())
      .await
      .unwrap();
    assert_eq!(event, Some(UiEvent::Flushed(1)));
  }

  #[tokio::test]
  async fn test_reconnect_drains_queue() {
    let s = setup(Duration::from_secs(3600));
    s.transport.route("POST", "/api/runs", CapturedResponse::new(201, ""));
    s.connectivity.set_online(false);
    s.transport.set_offline(true);
    let (handle, _join) = s.worker.spawn();

    let (monitor, mut view) = ConnectivityMonitor::new(
      handle.clone(),
      s.queue.clone(),
      s.connectivity.clone(),
      s.notifier.clone(),
    );
    tokio::spawn(monitor.run());

    let outcome = handle.handle(post_run()).await;
    assert!(matches!(outcome, Intercepted::Queued { .. }));
    wait_for(&mut view.state, |st| !st.is_online && st.queue_count == 1).await;

    s.transport.set_offline(false);
    s.connectivity.set_online(true);
    wait_for(&mut view.state, |st| st.is_online && st.queue_count == 0).await;

    let posts = s
      .transport
      .sent()
      .iter()
      .filter(|r| r.method == "POST" && r.path() == "/api/runs")
      .count();
    assert_eq!(posts, 1);
  }

  #[tokio::test]
  async fn test_going_offline_only_flips_flag() {
    let s = setup(Duration::from_secs(3600));
    let (handle, _join) = s.worker.spawn();
    let (monitor, mut view) =
      ConnectivityMonitor::new(handle, s.queue.clone(), s.connectivity.clone(), s.notifier.clone());
    tokio::spawn(monitor.run());
    wait_for(&mut view.state, |st| st.is_online).await;

    s.connectivity.set_online(false);
    let state = wait_for(&mut view.state, |st| !st.is_online).await;
    assert_eq!(state.queue_count, 0);
    assert!(view.events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_failed_mutation_is_surfaced() {
    let s = setup(Duration::from_secs(3600));
    let (handle, _join) = s.worker.spawn();
    let (monitor, mut view) =
      ConnectivityMonitor::new(handle, s.queue.clone(), s.connectivity.clone(), s.notifier.clone());
    tokio::spawn(monitor.run());
    wait_for(&mut view.state, |st| st.is_online).await;

    s.notifier.publish(Message::OfflineMutationFailed {
      id: 7,
      method: "POST".to_string(),
      url: "https://pacer.example/api/runs".to_string(),
      attempts: 8,
    });
    let event = tokio::time::timeout(Duration::from_secs(5), view.events.recv())
      .await
      .unwrap();
    assert_eq!(
      event,
      Some(UiEvent::MutationFailed {
        id: 7,
        method: "POST".to_string(),
        url: "https://pacer.example/api/runs".to_string(),
      })
    );
  }
}
