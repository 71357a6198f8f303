//! Background context: intercepts requests and is the only owner of
//! queue deletions.
//!
//! Foreground code never replays or deletes records itself. It asks the
//! worker to drain and waits for the report, so at most one drain runs
//! against the store at a time.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::connectivity::Connectivity;
use crate::event::{Message, Notifier};
use crate::interceptor::{Intercepted, Interceptor};
use crate::net::{HttpRequest, Transport};
use crate::queue::QueueStore;
use crate::replay::{DrainReport, DrainTrigger, ReplayEngine};

enum Command {
  Flush {
    trigger: DrainTrigger,
    reply: oneshot::Sender<Result<DrainReport>>,
  },
  RetryFailed {
    id: i64,
    reply: oneshot::Sender<Result<bool>>,
  },
  Discard {
    id: i64,
    reply: oneshot::Sender<Result<bool>>,
  },
}

pub struct Worker<T: Transport, S: CacheStorage> {
  interceptor: Interceptor<T, S>,
  engine: ReplayEngine<T>,
  queue: QueueStore,
  notifier: Notifier,
  connectivity: Connectivity,
  shell_assets: Vec<HttpRequest>,
  retry_interval: Duration,
}

/// Cloneable access to a running worker.
pub struct WorkerHandle<T: Transport, S: CacheStorage> {
  interceptor: Interceptor<T, S>,
  tx: mpsc::Sender<Command>,
  notifier: Notifier,
}

impl<T: Transport, S: CacheStorage> Worker<T, S> {
  pub fn new(
    interceptor: Interceptor<T, S>,
    engine: ReplayEngine<T>,
    queue: QueueStore,
    notifier: Notifier,
    connectivity: Connectivity,
    shell_assets: Vec<HttpRequest>,
    retry_interval: Duration,
  ) -> Self {
    Self {
      interceptor,
      engine,
      queue,
      notifier,
      connectivity,
      shell_assets,
      retry_interval,
    }
  }

  /// Start the worker loop on the runtime.
  pub fn spawn(self) -> (WorkerHandle<T, S>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let messages = self.notifier.subscribe();
    let handle = WorkerHandle {
      interceptor: self.interceptor.clone(),
      tx,
      notifier: self.notifier.clone(),
    };
    let join = tokio::spawn(self.run(rx, messages));
    (handle, join)
  }

  /// Drop outdated caches and fill the shell cache.
  pub async fn install(&self) {
    let cache = self.interceptor.cache();
    if let Err(e) = cache.activate() {
      warn!(error = %e, "failed to clear outdated caches");
    }
    if self.connectivity.is_online() && !self.shell_assets.is_empty() {
      let stored = cache.precache(&self.shell_assets, self.interceptor.transport()).await;
      debug!(stored, total = self.shell_assets.len(), "precached shell assets");
    }
  }

  async fn run(
    self,
    mut rx: mpsc::Receiver<Command>,
    mut messages: broadcast::Receiver<Message>,
  ) {
    self.install().await;

    let mut ticker = tokio::time::interval(self.retry_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
      tokio::select! {
        command = rx.recv() => match command {
          Some(command) => self.execute(command).await,
          None => break,
        },
        message = messages.recv() => match message {
          Ok(Message::FlushOfflineQueue) => {
            self.drain_logged(DrainTrigger::Requested).await;
          }
          Ok(_) | Err(RecvError::Lagged(_)) => {}
          Err(RecvError::Closed) => break,
        },
        _ = ticker.tick() => {
          if self.connectivity.is_online() && self.queue.count().unwrap_or(0) > 0 {
            self.drain_logged(DrainTrigger::RetryTimer).await;
          }
        }
      }
    }
    info!("background worker stopped");
  }

  async fn execute(&self, command: Command) {
    match command {
      Command::Flush { trigger, reply } => {
        let _ = reply.send(self.engine.drain(trigger).await);
      }
      Command::RetryFailed { id, reply } => {
        let result = self.queue.retry_failed(id);
        if matches!(result, Ok(true)) {
          self.publish_count();
        }
        let _ = reply.send(result);
      }
      Command::Discard { id, reply } => {
        let _ = reply.send(self.queue.discard(id));
      }
    }
  }

  async fn drain_logged(&self, trigger: DrainTrigger) {
    if let Err(e) = self.engine.drain(trigger).await {
      warn!(?trigger, error = %e, "drain failed");
    }
  }

  fn publish_count(&self) {
    if let Ok(queue_count) = self.queue.count() {
      self
        .notifier
        .publish(Message::OfflineQueueUpdated { queue_count });
    }
  }
}

impl<T: Transport, S: CacheStorage> WorkerHandle<T, S> {
  /// Route a request through the interceptor.
  pub async fn handle(&self, request: HttpRequest) -> Intercepted {
    self.interceptor.handle(request).await
  }

  /// Ask the worker to drain and wait for the outcome.
  pub async fn flush(&self, trigger: DrainTrigger) -> Result<DrainReport> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Flush { trigger, reply })
      .await
      .map_err(|_| eyre!("Background worker is not running"))?;
    rx.await
      .map_err(|_| eyre!("Background worker dropped the flush request"))?
  }

  /// Close the command channel and wait for the worker to finish its
  /// current step. Other clones of the handle keep the worker alive.
  pub async fn shutdown(self, join: JoinHandle<()>) {
    drop(self);
    if let Err(e) = join.await {
      warn!(error = %e, "background worker ended abnormally");
    }
  }

  /// Broadcast a flush request without waiting for it.
  pub fn request_flush(&self) {
    self.notifier.publish(Message::FlushOfflineQueue);
  }

  pub async fn retry_failed(&self, id: i64) -> Result<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::RetryFailed { id, reply })
      .await
      .map_err(|_| eyre!("Background worker is not running"))?;
    rx.await
      .map_err(|_| eyre!("Background worker dropped the request"))?
  }

  pub async fn discard(&self, id: i64) -> Result<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Discard { id, reply })
      .await
      .map_err(|_| eyre!("Background worker is not running"))?;
    rx.await
      .map_err(|_| eyre!("Background worker dropped the request"))?
  }
}

impl<T: Transport, S: CacheStorage> Clone for WorkerHandle<T, S> {
  fn clone(&self) -> Self {
    Self {
      interceptor: self.interceptor.clone(),
      tx: self.tx.clone(),
      notifier: self.notifier.clone(),
    }
  }
}
