use std::{
  io, mem,
  net::{Shutdown, SocketAddr},
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use crate::{
  net_utils::{domain_of, libc_socketaddr_into_std, std_socketaddr_into_libc},
  reactor::{Handle, Source},
};

/// A non-blocking socket registered with an event loop.
///
/// Every syscall wrapper returns `WouldBlock` instead of waiting; callers
/// park a continuation on [`source`](Self::source) and retry when woken.
pub(crate) struct Socket {
  source: Arc<Source>,
  fd: OwnedFd,
  broken: AtomicBool,
}

impl Socket {
  pub fn open(handle: &Handle, domain: libc::c_int, ty: libc::c_int) -> io::Result<Self> {
    let fd = syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;
    // SAFETY: socket(2) just handed us this descriptor.
    Ok(Self::from_fd(handle, unsafe { OwnedFd::from_raw_fd(fd) }))
  }

  /// Opens a socket of type `ty` in the address family of `addr`.
  pub fn open_for(handle: &Handle, addr: &SocketAddr, ty: libc::c_int) -> io::Result<Self> {
    Self::open(handle, domain_of(addr), ty)
  }

  /// Wraps an already non-blocking descriptor.
  pub fn from_fd(handle: &Handle, fd: OwnedFd) -> Self {
    let source = Source::new(handle, fd.as_raw_fd());
    Self { source, fd, broken: AtomicBool::new(false) }
  }

  pub fn fd(&self) -> RawFd {
    self.fd.as_raw_fd()
  }

  pub fn source(&self) -> &Arc<Source> {
    &self.source
  }

  pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(self.fd(), buf.as_mut_ptr().cast::<libc::c_void>(), buf.len(), 0))?;
    Ok(n as usize)
  }

  pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
      self.fd(),
      buf.as_ptr().cast::<libc::c_void>(),
      buf.len(),
      libc::MSG_NOSIGNAL
    ))?;
    Ok(n as usize)
  }

  pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let (storage, len) = std_socketaddr_into_libc(addr);
    let n = syscall!(sendto(
      self.fd(),
      buf.as_ptr().cast::<libc::c_void>(),
      buf.len(),
      libc::MSG_NOSIGNAL,
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len
    ))?;
    Ok(n as usize)
  }

  pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
      self.fd(),
      buf.as_mut_ptr().cast::<libc::c_void>(),
      buf.len(),
      0,
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len
    ))?;
    // SAFETY: recvfrom filled in the sender address.
    let from = unsafe { libc_socketaddr_into_std(&storage) }?;
    Ok((n as usize, from))
  }

  /// Full length of the datagram at the head of the receive queue, which
  /// stays queued. `MSG_TRUNC` reports the real length however small the
  /// buffer, and an empty queue is `WouldBlock` rather than 0, so a
  /// zero-length datagram cannot be mistaken for no datagram.
  pub fn peek_len(&self) -> io::Result<usize> {
    let mut probe = [0u8; 1];
    let n = syscall!(recv(
      self.fd(),
      probe.as_mut_ptr().cast::<libc::c_void>(),
      probe.len(),
      libc::MSG_PEEK | libc::MSG_TRUNC
    ))?;
    Ok(n as usize)
  }

  /// Starts connecting. `Ok(true)` means connected already, `Ok(false)` that
  /// the connection is in progress and completes once the socket turns
  /// writable.
  pub fn connect(&self, addr: SocketAddr) -> io::Result<bool> {
    let (storage, len) = std_socketaddr_into_libc(addr);
    match syscall_eintr!(connect(
      self.fd(),
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len
    )) {
      Ok(_) => Ok(true),
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
      Err(err) => Err(err),
    }
  }

  /// Reads and clears `SO_ERROR`.
  pub fn take_error(&self) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      self.fd(),
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      (&mut err as *mut libc::c_int).cast::<libc::c_void>(),
      &mut len
    ))?;
    Ok(if err == 0 { None } else { Some(io::Error::from_raw_os_error(err)) })
  }

  pub fn set_reuse_address(&self) -> io::Result<()> {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
      self.fd(),
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      (&on as *const libc::c_int).cast::<libc::c_void>(),
      mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
  }

  pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
    let (storage, len) = std_socketaddr_into_libc(addr);
    syscall!(bind(
      self.fd(),
      (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
      len
    ))?;
    Ok(())
  }

  pub fn listen(&self, backlog: i32) -> io::Result<()> {
    syscall!(listen(self.fd(), backlog))?;
    Ok(())
  }

  /// Accepts one pending connection as a non-blocking, close-on-exec
  /// descriptor.
  pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
      self.fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len,
      libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
    ))?;
    // SAFETY: accept4 just handed us this descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: accept4 filled in the peer address.
    let peer = unsafe { libc_socketaddr_into_std(&storage) }?;
    Ok((fd, peer))
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
      self.fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len
    ))?;
    // SAFETY: getsockname filled in the address.
    unsafe { libc_socketaddr_into_std(&storage) }
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
      self.fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
      &mut len
    ))?;
    // SAFETY: getpeername filled in the address.
    unsafe { libc_socketaddr_into_std(&storage) }
  }

  pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    let how = match how {
      Shutdown::Read => libc::SHUT_RD,
      Shutdown::Write => libc::SHUT_WR,
      Shutdown::Both => libc::SHUT_RDWR,
    };
    syscall!(shutdown(self.fd(), how))?;
    Ok(())
  }

  /// Shuts the socket down and fails every parked continuation. The
  /// descriptor itself is released on drop.
  pub fn close(&self) {
    if self.source.is_closed() {
      return;
    }
    // Close the source first so the hang-up below cannot wake a parked
    // continuation as if the peer had gone away.
    self.source.close();
    // Unconnected sockets report ENOTCONN here, which is fine.
    let _ = self.shutdown(Shutdown::Both);
  }

  pub fn is_open(&self) -> bool {
    !self.broken.load(Ordering::Acquire) && !self.source.is_closed()
  }

  /// Records that the socket failed in a way later I/O cannot recover from.
  pub fn mark_broken(&self) {
    self.broken.store(true, Ordering::Release);
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    // Deregister while the descriptor is still ours.
    self.source.close();
  }
}
