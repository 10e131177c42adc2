use std::{io, os::fd::RawFd, sync::Arc};

use super::{Handle, Interest};
use crate::sync::Mutex;

/// What a parked continuation is woken with.
#[derive(Debug)]
pub(crate) enum Readiness {
  /// The socket may be ready; retry the syscall.
  Ready,
  /// The source was closed while the continuation was parked.
  Closed,
  /// Registering interest with the poller failed.
  Failed(io::Error),
}

pub(crate) type Waiter = Box<dyn FnOnce(Readiness) + Send + 'static>;

#[derive(Default)]
struct Waiters {
  read: Option<Waiter>,
  write: Option<Waiter>,
  registered: bool,
  closed: bool,
}

impl Waiters {
  fn interest(&self) -> Interest {
    let mut interest = Interest::NONE;
    if self.read.is_some() {
      interest |= Interest::READ;
    }
    if self.write.is_some() {
      interest |= Interest::WRITE;
    }
    interest
  }
}

/// A file descriptor registered with the loop's poller.
///
/// The descriptor itself is owned elsewhere and must outlive the source.
/// Registration is one-shot: the source is armed only while a continuation
/// is parked, and each readiness event hands the parked continuation to the
/// single thread that observed it.
pub(crate) struct Source {
  fd: RawFd,
  token: u64,
  handle: Handle,
  waiters: Mutex<Waiters>,
}

impl Source {
  pub fn new(handle: &Handle, fd: RawFd) -> Arc<Self> {
    let source = Arc::new(Self {
      fd,
      token: handle.next_token(),
      handle: handle.clone(),
      waiters: Mutex::new(Waiters::default()),
    });
    handle.register(&source);
    source
  }

  pub fn token(&self) -> u64 {
    self.token
  }

  pub fn park_read(&self, waiter: Waiter) {
    self.park(Interest::READ, waiter);
  }

  pub fn park_write(&self, waiter: Waiter) {
    self.park(Interest::WRITE, waiter);
  }

  fn park(&self, direction: Interest, waiter: Waiter) {
    let mut waiters = self.waiters.lock();
    if waiters.closed {
      drop(waiters);
      self.handle.schedule(move || waiter(Readiness::Closed));
      return;
    }

    let slot =
      if direction.is_readable() { &mut waiters.read } else { &mut waiters.write };
    debug_assert!(slot.is_none(), "a continuation is already parked");
    *slot = Some(waiter);

    let interest = waiters.interest();
    let res = if waiters.registered {
      self.handle.poller_modify(self.fd, self.token, interest)
    } else {
      self.handle.poller_add(self.fd, self.token, interest)
    };

    match res {
      Ok(()) => waiters.registered = true,
      Err(err) => {
        let slot =
          if direction.is_readable() { &mut waiters.read } else { &mut waiters.write };
        let waiter = slot.take();
        drop(waiters);
        tracing::warn!(fd = self.fd, %err, "failed to arm socket readiness");
        if let Some(waiter) = waiter {
          self.handle.schedule(move || waiter(Readiness::Failed(err)));
        }
      }
    }
  }

  /// Called by the thread that observed readiness for this source.
  pub(super) fn on_ready(&self, ready: Interest) {
    let mut failed = Vec::new();
    let (read, write) = {
      let mut waiters = self.waiters.lock();
      if waiters.closed {
        return;
      }
      let read = if ready.is_readable() { waiters.read.take() } else { None };
      let write = if ready.is_writable() { waiters.write.take() } else { None };

      let remaining = waiters.interest();
      if !remaining.is_none() {
        if let Err(err) = self.handle.poller_modify(self.fd, self.token, remaining) {
          tracing::warn!(fd = self.fd, %err, "failed to re-arm socket readiness");
          for waiter in [waiters.read.take(), waiters.write.take()].into_iter().flatten() {
            failed.push((waiter, copy_error(&err)));
          }
        }
      }
      (read, write)
    };

    for (waiter, err) in failed {
      self.handle.schedule(move || waiter(Readiness::Failed(err)));
    }
    if let Some(waiter) = read {
      waiter(Readiness::Ready);
    }
    if let Some(waiter) = write {
      waiter(Readiness::Ready);
    }
  }

  /// Deregisters the descriptor and hands every parked continuation back to
  /// the loop with [`Readiness::Closed`]. Later parks fail the same way.
  pub fn close(&self) {
    let (read, write) = {
      let mut waiters = self.waiters.lock();
      if waiters.closed {
        return;
      }
      waiters.closed = true;
      if waiters.registered {
        waiters.registered = false;
        if let Err(err) = self.handle.poller_delete(self.fd) {
          tracing::warn!(fd = self.fd, %err, "failed to deregister socket");
        }
      }
      (waiters.read.take(), waiters.write.take())
    };

    for waiter in [read, write].into_iter().flatten() {
      self.handle.schedule(move || waiter(Readiness::Closed));
    }
  }

  pub fn is_closed(&self) -> bool {
    self.waiters.lock().closed
  }

  /// Drops parked continuations without running them.
  pub(super) fn discard_waiters(&self) -> usize {
    let (read, write) = {
      let mut waiters = self.waiters.lock();
      (waiters.read.take(), waiters.write.take())
    };
    [read, write].into_iter().flatten().count()
  }
}

impl Drop for Source {
  fn drop(&mut self) {
    self.handle.deregister(self.token);
    let waiters = self.waiters.get_mut();
    if waiters.registered && !waiters.closed {
      if let Err(err) = self.handle.poller_delete(self.fd) {
        tracing::warn!(fd = self.fd, %err, "failed to deregister socket");
      }
    }
  }
}

fn copy_error(err: &io::Error) -> io::Error {
  match err.raw_os_error() {
    Some(code) => io::Error::from_raw_os_error(code),
    None => io::Error::new(err.kind(), err.to_string()),
  }
}
