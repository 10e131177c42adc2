//! Connection types.
//!
//! - [`StreamConnection`]: exact-count reads and full writes over TCP, moved in
//!   bounded chunks.
//! - [`DatagramConnection`]: one datagram per read, one per write.
//! - [`Listener`]: a bound acceptor driven by its own pool of worker threads.

mod datagram;
mod listener;
mod socket;
mod stream;

pub use datagram::DatagramConnection;
pub use listener::Listener;
pub use std::net::Shutdown;
pub use stream::StreamConnection;

pub(crate) use socket::Socket;

use std::{
  fmt, ptr,
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

/// Which kind of socket a connection wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
  Stream,
  Datagram,
}

/// Process-unique connection identifier, used in logs and observer hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
  transport: Transport,
  serial: u64,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
  pub(crate) fn next(transport: Transport) -> Self {
    Self { transport, serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed) }
  }

  pub fn transport(&self) -> Transport {
    self.transport
  }

  pub fn serial(&self) -> u64 {
    self.serial
  }
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.transport {
      Transport::Stream => write!(f, "stream#{}", self.serial),
      Transport::Datagram => write!(f, "datagram#{}", self.serial),
    }
  }
}

/// A fixed-size scratch buffer lent to one operation at a time.
///
/// Lending swaps the pointer out, so a second concurrent borrower sees an
/// empty slot instead of blocking.
pub(crate) struct ScratchSlot {
  buf: AtomicPtr<Vec<u8>>,
}

impl ScratchSlot {
  pub fn new(len: usize) -> Self {
    Self { buf: AtomicPtr::new(Box::into_raw(Box::new(vec![0; len]))) }
  }

  /// Takes the buffer, or `None` while another operation holds it.
  pub fn lend(&self) -> Option<Box<Vec<u8>>> {
    let ptr = self.buf.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
      None
    } else {
      // SAFETY: non-null pointers in the slot always come from Box::into_raw,
      // and the swap made us their only owner.
      Some(unsafe { Box::from_raw(ptr) })
    }
  }

  pub fn give_back(&self, buf: Box<Vec<u8>>) {
    let old = self.buf.swap(Box::into_raw(buf), Ordering::AcqRel);
    debug_assert!(old.is_null(), "scratch buffer returned twice");
    if !old.is_null() {
      // SAFETY: as in `lend`.
      drop(unsafe { Box::from_raw(old) });
    }
  }
}

impl Drop for ScratchSlot {
  fn drop(&mut self) {
    drop(self.lend());
  }
}
