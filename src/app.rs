//! Wires the stores, the worker and the monitor together from config.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::cache::{CacheLayer, CacheNames, CacheStorage, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityProbe};
use crate::db::Database;
use crate::event::Notifier;
use crate::interceptor::{Interceptor, Routes};
use crate::monitor::{ConnectivityMonitor, MonitorView};
use crate::net::{HttpRequest, Identity, ReqwestTransport, TokenIdentity};
use crate::queue::QueueStore;
use crate::replay::ReplayEngine;
use crate::worker::{Worker, WorkerHandle};

pub type Storage = Box<dyn CacheStorage>;
pub type Handle = WorkerHandle<ReqwestTransport, Storage>;

/// Everything opened once per process and shared by both contexts.
pub struct App {
  config: Config,
  db: Database,
  queue: QueueStore,
  notifier: Notifier,
  connectivity: Connectivity,
  transport: Arc<ReqwestTransport>,
  identity: TokenIdentity,
}

impl App {
  pub fn open(config: Config) -> Result<Self> {
    let path = config.queue.resolve_path()?;
    let db = Database::open(&path)?;
    let queue = QueueStore::new(db.clone());

    Ok(Self {
      queue,
      db,
      notifier: Notifier::default(),
      // Assume offline until the first probe says otherwise.
      connectivity: Connectivity::new(false),
      transport: Arc::new(ReqwestTransport::new()?),
      identity: TokenIdentity::new(Config::get_api_token()),
      config,
    })
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// A request against the API base URL carrying the current credentials.
  pub fn request(
    &self,
    method: &str,
    path: &str,
    body: Option<String>,
    headers: &[(String, String)],
  ) -> Result<HttpRequest> {
    let mut request = HttpRequest::relative(method, &self.config.api.base_url, path)?;
    request.headers.extend(self.identity.headers());
    if let Some(body) = body {
      request = request
        .with_header("content-type", "application/json")
        .with_body(body);
    }
    for (name, value) in headers {
      request = request.with_header(name, value.clone());
    }
    Ok(request)
  }

  pub fn probe(&self) -> Result<ConnectivityProbe<ReqwestTransport>> {
    let health = HttpRequest::relative(
      "GET",
      &self.config.api.base_url,
      &self.config.api.health_path,
    )?;
    Ok(ConnectivityProbe::new(
      Arc::clone(&self.transport),
      self.connectivity.clone(),
      health,
      self.config.connectivity.probe_interval(),
    ))
  }

  fn storage(&self) -> Storage {
    if self.config.cache.enabled {
      Box::new(SqliteStorage::new(self.db.clone()))
    } else {
      Box::new(NoopStorage)
    }
  }

  /// Build and start the background worker.
  pub fn spawn_worker(&self) -> Result<(Handle, tokio::task::JoinHandle<()>)> {
    let names = CacheNames::new(&self.config.cache.shell_version, &self.config.cache.api_version);
    let cache = CacheLayer::new(self.storage(), names);
    let interceptor = Interceptor::new(
      Arc::clone(&self.transport),
      cache,
      self.queue.clone(),
      self.notifier.clone(),
      Routes::from_config(&self.config)?,
    );
    let engine = ReplayEngine::new(
      Arc::clone(&self.transport),
      Arc::new(self.identity.clone()),
      self.queue.clone(),
      self.notifier.clone(),
      self.connectivity.clone(),
      self.config.replay.policy,
    );

    let shell_assets = self
      .config
      .cache
      .shell_assets
      .iter()
      .map(|path| HttpRequest::relative("GET", &self.config.api.base_url, path))
      .collect::<Result<Vec<_>>>()?;

    let worker = Worker::new(
      interceptor,
      engine,
      self.queue.clone(),
      self.notifier.clone(),
      self.connectivity.clone(),
      shell_assets,
      self.config.replay.retry_interval(),
    );
    Ok(worker.spawn())
  }

  pub fn monitor(
    &self,
    handle: Handle,
  ) -> (ConnectivityMonitor<ReqwestTransport, Storage>, MonitorView) {
    ConnectivityMonitor::new(
      handle,
      self.queue.clone(),
      self.connectivity.clone(),
      self.notifier.clone(),
    )
  }

  pub fn close(&self) -> Result<()> {
    self
      .db
      .close()
      .map_err(|e| eyre!("Failed to close offline store: {}", e))
  }
}
