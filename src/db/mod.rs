pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared handle to the on-disk store holding the offline queue and the
/// response caches.
///
/// Constructed once and handed to both the background worker and the
/// foreground monitor. Clones share the same connection.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(schema::PRAGMAS)
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    let db = Self {
      conn: Arc::new(Mutex::new(Some(conn))),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pacer").join("offline.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(schema::SCHEMA)
        .map_err(|e| eyre!("Failed to run migrations: {}", e))
    })
  }

  /// Close the connection. Every later operation on any clone fails.
  pub fn close(&self) -> Result<()> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(conn) = guard.take() {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close database: {}", e))?;
    }
    Ok(())
  }

  pub fn is_open(&self) -> bool {
    self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
  }

  /// Run `f` with exclusive access to the connection
  pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard.as_mut().ok_or_else(|| eyre!("Database is closed"))?;
    f(conn)
  }
}
