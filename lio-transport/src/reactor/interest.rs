/// Interest/readiness flags.
///
/// This type is used for both:
/// - Registering interest (what a source wants to be notified about)
/// - Receiving events (what actually happened)
///
/// Errors and hang-ups are reported as both readable and writable so that
/// whichever continuation is parked gets to observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
  bits: u8,
}

impl Interest {
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  /// Combine interests using bitwise OR
  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  pub(crate) fn to_epoll(self) -> u32 {
    let mut events = 0u32;
    if self.is_readable() {
      events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if self.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }
    events
  }

  pub(crate) fn from_epoll(events: u32) -> Self {
    let failed = events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
    let readable =
      events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0;
    let writable = events & libc::EPOLLOUT as u32 != 0;

    let mut interest = Self::NONE;
    if readable || failed {
      interest |= Self::READ;
    }
    if writable || failed {
      interest |= Self::WRITE;
    }
    interest
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl std::ops::BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}
