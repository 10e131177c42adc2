use super::interest::Interest;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Key reserved for the loop's own wake-up notifier.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

/// Wrapper around an epoll file descriptor shared by every worker thread.
///
/// Sources are registered with `EPOLLONESHOT`: a readiness event is handed to
/// exactly one `epoll_wait` caller and the source stays disarmed until it is
/// explicitly re-armed with [`OsPoller::modify`]. The notifier is the only
/// level-triggered registration, so a single `notify` wakes every waiting
/// worker until somebody clears it.
pub(crate) struct OsPoller {
  epoll_fd: OwnedFd,
  notifier: Notifier,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let epoll_fd = {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      // SAFETY: epoll_create1 just handed us this descriptor.
      unsafe { OwnedFd::from_raw_fd(fd) }
    };

    let poller = Self { epoll_fd, notifier: Notifier::new()? };

    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      poller.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      poller.notifier.as_fd().as_raw_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(poller)
  }

  /// Add a one-shot registration for a file descriptor.
  /// This is not idempotent.
  pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  /// Re-arm an existing registration.
  /// This is idempotent, but fails if not added before.
  pub fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut event = libc::epoll_event {
      events: interest.to_epoll() | libc::EPOLLONESHOT as u32,
      u64: key,
    };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  /// Remove all interest for a file descriptor.
  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    // For EPOLL_CTL_DEL, event pointer can be NULL in Linux 2.6.9+
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  /// Wait for events, filling `events`. `None` blocks indefinitely.
  ///
  /// An interrupted wait reports zero events.
  pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = match timeout {
      None => -1,
      Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    events.clear();
    let capacity = events.events.capacity();
    let n = match syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.events.as_mut_ptr(),
      capacity as libc::c_int,
      timeout_ms,
    )) {
      Ok(n) => n as usize,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
      Err(err) => return Err(err),
    };

    // SAFETY: the kernel initialised the first `n` entries, and n <= capacity.
    unsafe { events.events.set_len(n) };
    Ok(n)
  }

  /// Wake up every blocking `wait` call.
  pub fn notify(&self) {
    self.notifier.notify();
  }

  /// Clear the notification.
  pub fn clear_notify(&self) {
    self.notifier.clear();
  }
}

/// A reusable buffer of readiness events.
pub(crate) struct Events {
  events: Vec<libc::epoll_event>,
}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    Self { events: Vec::with_capacity(capacity) }
  }

  fn clear(&mut self) {
    self.events.clear();
  }

  pub fn iter(&self) -> impl Iterator<Item = (u64, Interest)> + '_ {
    self.events.iter().map(|event| {
      // Copy out of the packed struct before use.
      let key = event.u64;
      let bits = event.events;
      (key, Interest::from_epoll(bits))
    })
  }
}

impl Default for Events {
  fn default() -> Self {
    Self::with_capacity(256)
  }
}

enum Notifier {
  /// The primary notifier, using eventfd.
  EventFd(OwnedFd),

  /// The fallback notifier, using a pipe.
  Pipe {
    /// The read end of the pipe.
    read_pipe: OwnedFd,

    /// The write end of the pipe.
    write_pipe: OwnedFd,
  },
}

impl AsFd for Notifier {
  fn as_fd(&self) -> BorrowedFd<'_> {
    match self {
      Notifier::EventFd(fd) => fd.as_fd(),
      Notifier::Pipe { read_pipe: read, .. } => read.as_fd(),
    }
  }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
  let mut fds = MaybeUninit::<[libc::c_int; 2]>::uninit();
  syscall!(pipe2(fds.as_mut_ptr().cast::<libc::c_int>(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
  // SAFETY: pipe2 succeeded, so both descriptors are initialised and ours.
  let [read, write] = unsafe { fds.assume_init() };
  Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

impl Notifier {
  fn new() -> io::Result<Self> {
    match syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)) {
      // SAFETY: eventfd just handed us this descriptor.
      Ok(fd) => Ok(Notifier::EventFd(unsafe { OwnedFd::from_raw_fd(fd) })),
      Err(err) => {
        tracing::debug!(%err, "eventfd unavailable, falling back to a pipe");
        let (read_pipe, write_pipe) = pipe()?;
        Ok(Notifier::Pipe { read_pipe, write_pipe })
      }
    }
  }

  fn notify(&self) {
    match self {
      Self::EventFd(fd) => {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let _ = syscall!(write(
          fd.as_raw_fd(),
          buf.as_ptr().cast::<libc::c_void>(),
          buf.len()
        ));
      }

      Self::Pipe { write_pipe, .. } => {
        let buf = [0; 1];
        syscall!(write(
          write_pipe.as_raw_fd(),
          buf.as_ptr().cast::<libc::c_void>(),
          buf.len()
        ))
        .ok();
      }
    }
  }

  fn clear(&self) {
    match self {
      Self::EventFd(fd) => {
        const SIZE: usize = 8;
        let mut buf = [0u8; SIZE];
        let _ = syscall!(read(
          fd.as_raw_fd(),
          buf.as_mut_ptr().cast::<libc::c_void>(),
          SIZE
        ));
      }

      Self::Pipe { read_pipe, .. } => {
        const SIZE: usize = 1024;
        let mut buf = [0u8; SIZE];
        while syscall!(read(
          read_pipe.as_raw_fd(),
          buf.as_mut_ptr().cast::<libc::c_void>(),
          SIZE
        ))
        .is_ok_and(|n| n > 0)
        {}
      }
    }
  }
}
