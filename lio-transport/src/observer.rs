//! Diagnostic hooks.
//!
//! An [`Observer`] is handed to a connection through
//! [`ConnectionConfig::observer`](crate::ConnectionConfig::observer) and sees
//! the payloads moving through it. Observers are purely observational: they run
//! inline on whichever worker drives the operation, so keep them cheap.
//!
//! [`HexDump`] is the stock observer. It writes classic 16-column hex dumps at
//! `TRACE` level:
//!
//! ```text
//! read #3 {
//! 48 65 6C 6C 6F -- -- -- -- -- -- -- -- -- -- -- Hello
//! }
//! ```

use std::{fmt::Write as _, net::SocketAddr};

use crate::{Error, net::ConnectionId, net::Transport};

/// Receives notifications about connection activity. Every hook defaults to a
/// no-op.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
  fn connected(&self, id: ConnectionId, peer: SocketAddr) {}

  fn accepted(&self, id: ConnectionId, peer: SocketAddr) {}

  /// One `recv` landed `chunk` in the scratch buffer.
  fn read_chunk(&self, id: ConnectionId, chunk: &[u8]) {}

  /// A read chain finished with the full payload.
  fn read_complete(&self, id: ConnectionId, data: &[u8]) {}

  /// A write chain is about to start sending `data`.
  fn write_started(&self, id: ConnectionId, data: &[u8]) {}

  /// One `send` accepted `chunk`.
  fn write_chunk(&self, id: ConnectionId, chunk: &[u8]) {}

  fn datagram_received(&self, id: ConnectionId, from: SocketAddr, payload: &[u8]) {}

  fn datagram_sent(&self, id: ConnectionId, payload: &[u8]) {}

  fn failed(&self, id: ConnectionId, error: &Error) {}
}

/// Selects which transports [`HexDump`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category {
  bits: u8,
}

impl Category {
  pub const NONE: Self = Self { bits: 0 };
  pub const STREAM: Self = Self { bits: 1 << 0 };
  pub const DATAGRAM: Self = Self { bits: 1 << 1 };
  pub const ALL: Self = Self { bits: Self::STREAM.bits | Self::DATAGRAM.bits };

  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }

  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  const fn of(transport: Transport) -> Self {
    match transport {
      Transport::Stream => Self::STREAM,
      Transport::Datagram => Self::DATAGRAM,
    }
  }
}

impl std::ops::BitOr for Category {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

/// Logs payloads as hex dumps through `tracing`.
#[derive(Debug, Clone)]
pub struct HexDump {
  mask: Category,
  limit: usize,
}

impl HexDump {
  /// Dumps every transport, skipping payloads of 1024 bytes or more.
  pub fn new() -> Self {
    Self { mask: Category::ALL, limit: crate::config::DEFAULT_CHUNK_SIZE }
  }

  pub fn mask(mut self, mask: Category) -> Self {
    self.mask = mask;
    self
  }

  /// Payloads of `limit` bytes or more are only summarised.
  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  fn enabled(&self, id: ConnectionId) -> bool {
    self.mask.contains(Category::of(id.transport()))
  }

  fn emit(&self, id: ConnectionId, title: &str, data: &[u8]) {
    if !self.enabled(id) {
      return;
    }
    if data.len() >= self.limit {
      tracing::trace!(%id, len = data.len(), "{title}");
      return;
    }
    tracing::trace!("{}", dump(&format!("{title} {id}"), data));
  }
}

impl Default for HexDump {
  fn default() -> Self {
    Self::new()
  }
}

impl Observer for HexDump {
  fn connected(&self, id: ConnectionId, peer: SocketAddr) {
    if self.enabled(id) {
      tracing::trace!(%id, %peer, "connected");
    }
  }

  fn accepted(&self, id: ConnectionId, peer: SocketAddr) {
    if self.enabled(id) {
      tracing::trace!(%id, %peer, "accepted");
    }
  }

  fn read_complete(&self, id: ConnectionId, data: &[u8]) {
    self.emit(id, "Read:", data);
  }

  fn write_started(&self, id: ConnectionId, data: &[u8]) {
    self.emit(id, "Write:", data);
  }

  fn datagram_received(&self, id: ConnectionId, from: SocketAddr, payload: &[u8]) {
    self.emit(id, &format!("Datagram from {from}:"), payload);
  }

  fn datagram_sent(&self, id: ConnectionId, payload: &[u8]) {
    self.emit(id, "Datagram:", payload);
  }

  fn failed(&self, id: ConnectionId, error: &Error) {
    if self.enabled(id) {
      tracing::trace!(%id, %error, "operation failed");
    }
  }
}

/// Renders `data` as 16 bytes per line: hex columns, `--` padding, then the
/// printable ASCII with `.` for everything else.
pub fn dump(title: &str, data: &[u8]) -> String {
  let mut out = String::with_capacity(title.len() + 4 + data.len().div_ceil(16) * 66);
  let _ = writeln!(out, "{title} {{");
  for line in data.chunks(16) {
    for byte in line {
      let _ = write!(out, "{byte:02X} ");
    }
    for _ in line.len()..16 {
      out.push_str("-- ");
    }
    out.extend(line.iter().map(|&b| if (b' '..=b'~').contains(&b) { b as char } else { '.' }));
    out.push('\n');
  }
  out.push('}');
  out
}
