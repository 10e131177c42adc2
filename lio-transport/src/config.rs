//! Connection and listener configuration.
//!
//! Both types are plain values built with chained setters, the same way
//! `std::fs::OpenOptions` is:
//!
//! ```rust
//! use lio_transport::{ConnectionConfig, ListenerConfig};
//!
//! let conn = ConnectionConfig::new().chunk_size(4096);
//! let listener = ListenerConfig::new(8080).address("127.0.0.1").workers(4).connection(conn);
//! assert_eq!(listener.worker_count(), 4);
//! ```

use std::{fmt, sync::Arc};

use crate::observer::Observer;

/// Maximum bytes moved per underlying `recv`/`send` on a stream connection.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header).
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

pub const DEFAULT_WORKERS: usize = 2;

pub const DEFAULT_BACKLOG: i32 = 128;

/// Per-connection settings.
#[derive(Clone)]
pub struct ConnectionConfig {
  chunk_size: usize,
  max_datagram_size: usize,
  observer: Option<Arc<dyn Observer>>,
}

impl ConnectionConfig {
  pub fn new() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
      observer: None,
    }
  }

  /// Sets the per-syscall transfer bound, which is also the size of each of
  /// the connection's two scratch buffers.
  ///
  /// # Panics
  ///
  /// Panics if `size` is zero.
  pub fn chunk_size(mut self, size: usize) -> Self {
    assert!(size > 0, "chunk size must be non-zero");
    self.chunk_size = size;
    self
  }

  /// Sets the largest payload a datagram write accepts.
  ///
  /// # Panics
  ///
  /// Panics if `size` is zero.
  pub fn max_datagram_size(mut self, size: usize) -> Self {
    assert!(size > 0, "max datagram size must be non-zero");
    self.max_datagram_size = size;
    self
  }

  /// Installs a diagnostic observer, see [`crate::observer`].
  pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
    self.observer = Some(observer);
    self
  }

  pub fn get_chunk_size(&self) -> usize {
    self.chunk_size
  }

  pub fn get_max_datagram_size(&self) -> usize {
    self.max_datagram_size
  }

  pub fn get_observer(&self) -> Option<&Arc<dyn Observer>> {
    self.observer.as_ref()
  }
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ConnectionConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionConfig")
      .field("chunk_size", &self.chunk_size)
      .field("max_datagram_size", &self.max_datagram_size)
      .field("observer", &self.observer.is_some())
      .finish()
  }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
  address: String,
  port: u16,
  workers: usize,
  backlog: i32,
  connection: ConnectionConfig,
}

impl ListenerConfig {
  /// Listen on `port` on every IPv4 interface with the default worker count.
  pub fn new(port: u16) -> Self {
    Self {
      address: String::new(),
      port,
      workers: DEFAULT_WORKERS,
      backlog: DEFAULT_BACKLOG,
      connection: ConnectionConfig::new(),
    }
  }

  /// Local address to bind. Empty means all interfaces.
  pub fn address(mut self, address: impl Into<String>) -> Self {
    self.address = address.into();
    self
  }

  pub fn port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  /// Number of OS threads driving the listener's event loop.
  ///
  /// # Panics
  ///
  /// Panics if `workers` is zero.
  pub fn workers(mut self, workers: usize) -> Self {
    assert!(workers > 0, "a listener needs at least one worker");
    self.workers = workers;
    self
  }

  pub fn backlog(mut self, backlog: i32) -> Self {
    self.backlog = backlog;
    self
  }

  /// Settings applied to every accepted connection.
  pub fn connection(mut self, connection: ConnectionConfig) -> Self {
    self.connection = connection;
    self
  }

  pub fn get_address(&self) -> &str {
    &self.address
  }

  pub fn get_port(&self) -> u16 {
    self.port
  }

  pub fn worker_count(&self) -> usize {
    self.workers
  }

  pub fn get_backlog(&self) -> i32 {
    self.backlog
  }

  pub fn get_connection(&self) -> &ConnectionConfig {
    &self.connection
  }

  pub(crate) fn set_workers(&mut self, workers: usize) {
    assert!(workers > 0, "a listener needs at least one worker");
    self.workers = workers;
  }
}
