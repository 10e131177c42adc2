//! Transport error type.
//!
//! Every failure is an [`ErrorKind`] saying *which* operation failed plus the
//! underlying [`io::Error`] saying *why*. Callers branch on the kind and, when
//! they need to, on the OS code via [`Error::raw_os_error`].

use std::{fmt, io};

/// Which step of the transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
  /// Turning a host + port into endpoints failed or produced none.
  Resolve,
  /// Opening or connecting the socket failed.
  Connect,
  /// A receive failed, including end-of-stream before the requested count.
  Read,
  /// A send failed.
  Write,
  /// Binding, listening or accepting failed.
  Accept,
  /// The socket was closed locally or is known to be broken.
  SocketClosed,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Resolve => "resolution failed",
      Self::Connect => "connect failed",
      Self::Read => "read failed",
      Self::Write => "write failed",
      Self::Accept => "accept failed",
      Self::SocketClosed => "socket closed",
    })
  }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct Error {
  kind: ErrorKind,
  #[source]
  source: io::Error,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A result paired with the buffer the operation borrowed.
///
/// Operations that write into caller-owned storage take the buffer by value
/// and always hand it back, success or not.
pub type BufResult<T, B> = (Result<T>, B);

impl Error {
  pub fn new(kind: ErrorKind, source: io::Error) -> Self {
    Self { kind, source }
  }

  pub(crate) fn from_errno(kind: ErrorKind, errno: i32) -> Self {
    Self::new(kind, io::Error::from_raw_os_error(errno))
  }

  pub(crate) fn closed() -> Self {
    Self::from_errno(ErrorKind::SocketClosed, libc::EBADF)
  }

  pub(crate) fn busy(kind: ErrorKind, what: &'static str) -> Self {
    Self::new(kind, io::Error::new(io::ErrorKind::ResourceBusy, what))
  }

  pub(crate) fn eof(received: usize, expected: usize) -> Self {
    Self::new(
      ErrorKind::Read,
      io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("peer closed after {received} of {expected} bytes"),
      ),
    )
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  /// The OS error code, when the failure came from a syscall.
  pub fn raw_os_error(&self) -> Option<i32> {
    self.source.raw_os_error()
  }

  pub fn io_kind(&self) -> io::ErrorKind {
    self.source.kind()
  }

  pub fn as_io(&self) -> &io::Error {
    &self.source
  }

  pub fn into_io(self) -> io::Error {
    self.source
  }

  /// Whether this failure means the socket can no longer be used.
  pub fn is_fatal(&self) -> bool {
    self.kind == ErrorKind::SocketClosed || is_broken(&self.source)
  }
}

/// Errors after which further I/O on the same socket cannot succeed.
pub(crate) fn is_broken(err: &io::Error) -> bool {
  matches!(
    err.raw_os_error(),
    Some(
      libc::EBADF
        | libc::ENOTCONN
        | libc::EPIPE
        | libc::ECONNRESET
        | libc::ECONNABORTED
        | libc::ESHUTDOWN
    )
  )
}
