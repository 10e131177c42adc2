use std::{
  io, mem,
  net::{Shutdown, SocketAddr},
  os::fd::OwnedFd,
  sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
  },
};

use super::{ConnectionId, ScratchSlot, Socket, Transport};
use crate::{
  BufResult, ConnectionConfig, Error, ErrorKind, Result,
  chunk::{ChunkPolicy, ReadChain, Step, WriteChain},
  error::is_broken,
  net_utils::domain_of,
  observer::Observer,
  reactor::{Handle, Readiness, Source},
  resolve,
  sync::Mutex,
};

/// A connection-oriented socket with exact-count reads and full writes.
///
/// Cloning is cheap; every clone refers to the same socket. Pending
/// operations keep the connection alive, so dropping every handle while a
/// read is outstanding is fine: the read still completes (or fails) and the
/// socket closes afterwards.
///
/// At most one read and one write may be in flight at a time. A second one
/// fails with [`io::ErrorKind::ResourceBusy`] and leaves the first alone.
///
/// Callbacks run on the event loop's worker threads and must not block.
#[derive(Clone)]
pub struct StreamConnection {
  inner: Arc<StreamInner>,
}

struct StreamInner {
  id: ConnectionId,
  handle: Handle,
  config: ConnectionConfig,
  policy: ChunkPolicy,
  socket: OnceLock<Socket>,
  connecting: AtomicBool,
  dial: Mutex<Dial>,
  read_scratch: ScratchSlot,
  write_scratch: ScratchSlot,
}

/// Where an outgoing connect stands, so [`StreamConnection::close`] can abort
/// one still in progress.
enum Dial {
  Idle,
  InProgress(Arc<Source>),
  Closed,
}

impl StreamConnection {
  pub fn new(handle: &Handle) -> Self {
    Self::with_config(handle, ConnectionConfig::default())
  }

  pub fn with_config(handle: &Handle, config: ConnectionConfig) -> Self {
    let chunk_size = config.get_chunk_size();
    Self {
      inner: Arc::new(StreamInner {
        id: ConnectionId::next(Transport::Stream),
        handle: handle.clone(),
        policy: ChunkPolicy::new(chunk_size),
        config,
        socket: OnceLock::new(),
        connecting: AtomicBool::new(false),
        dial: Mutex::new(Dial::Idle),
        read_scratch: ScratchSlot::new(chunk_size),
        write_scratch: ScratchSlot::new(chunk_size),
      }),
    }
  }

  pub(crate) fn from_accepted(
    handle: &Handle,
    config: ConnectionConfig,
    fd: OwnedFd,
    peer: SocketAddr,
  ) -> Self {
    let conn = Self::with_config(handle, config);
    let _ = conn.inner.socket.set(Socket::from_fd(handle, fd));
    conn.inner.observe(|o| o.accepted(conn.inner.id, peer));
    tracing::debug!(id = %conn.inner.id, %peer, "accepted");
    conn
  }

  pub fn id(&self) -> ConnectionId {
    self.inner.id
  }

  pub fn config(&self) -> &ConnectionConfig {
    &self.inner.config
  }

  pub fn handle(&self) -> &Handle {
    &self.inner.handle
  }

  /// Resolves `host` and connects to the first endpoint it yields.
  ///
  /// Fails with [`ErrorKind::Resolve`] when the name does not resolve and with
  /// [`ErrorKind::Connect`] otherwise. Connecting twice fails with `EISCONN`.
  pub fn connect<F>(&self, host: &str, port: u16, cb: F)
  where
    F: FnOnce(Result<()>) + Send + 'static,
  {
    let inner = &self.inner;
    if inner.socket.get().is_some() {
      let err = Error::from_errno(ErrorKind::Connect, libc::EISCONN);
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }
    if inner.connecting.swap(true, Ordering::AcqRel) {
      let err = Error::busy(ErrorKind::Connect, "a connect is already in progress");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }

    let this = Arc::clone(inner);
    resolve::resolve(&inner.handle, host, port, move |resolved| {
      let addr = match resolved {
        Ok(addrs) => addrs[0],
        Err(err) => return this.connect_done(None, Err(err), cb),
      };
      tracing::debug!(id = %this.id, %addr, "connecting");

      let socket = match Socket::open(&this.handle, domain_of(&addr), libc::SOCK_STREAM) {
        Ok(socket) => socket,
        Err(err) => return this.connect_done(None, Err(Error::new(ErrorKind::Connect, err)), cb),
      };
      {
        let mut dial = this.dial.lock();
        if matches!(*dial, Dial::Closed) {
          drop(dial);
          return this.connect_done(None, Err(Error::closed()), cb);
        }
        *dial = Dial::InProgress(Arc::clone(socket.source()));
      }

      match socket.connect(addr) {
        Ok(true) => this.connect_done(Some((socket, addr)), Ok(()), cb),
        Ok(false) => {
          let source = Arc::clone(socket.source());
          source.park_write(Box::new(move |readiness| {
            let result = match readiness {
              Readiness::Ready => match socket.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(err)) | Err(err) => Err(Error::new(ErrorKind::Connect, err)),
              },
              Readiness::Closed => Err(Error::closed()),
              Readiness::Failed(err) => Err(Error::new(ErrorKind::Connect, err)),
            };
            this.connect_done(Some((socket, addr)), result, cb);
          }));
        }
        Err(err) => this.connect_done(None, Err(Error::new(ErrorKind::Connect, err)), cb),
      }
    });
  }

  /// Reads exactly `len` bytes.
  ///
  /// End of stream before `len` bytes arrived is an [`ErrorKind::Read`] error
  /// with [`io::ErrorKind::UnexpectedEof`]. Reading zero bytes succeeds with
  /// an empty vector without touching the socket.
  pub fn read<F>(&self, len: usize, cb: F)
  where
    F: FnOnce(Result<Vec<u8>>) + Send + 'static,
  {
    if len == 0 {
      self.inner.handle.schedule(move || cb(Ok(Vec::new())));
      return;
    }
    self.read_into(len, vec![0; len], move |(result, buf)| cb(result.map(|()| buf)));
  }

  /// Reads exactly `len` bytes into the front of `buf`.
  ///
  /// The buffer travels with the operation and is handed back with the
  /// result. On failure its first bytes hold whatever arrived before the
  /// error.
  pub fn read_into<B, F>(&self, len: usize, mut buf: B, cb: F)
  where
    B: AsMut<[u8]> + Send + 'static,
    F: FnOnce(BufResult<(), B>) + Send + 'static,
  {
    let inner = &self.inner;
    if buf.as_mut().len() < len {
      let err = Error::new(
        ErrorKind::Read,
        io::Error::new(
          io::ErrorKind::InvalidInput,
          format!("buffer holds {} bytes, {len} requested", buf.as_mut().len()),
        ),
      );
      inner.handle.schedule(move || cb((Err(err), buf)));
      return;
    }
    if len == 0 {
      inner.handle.schedule(move || cb((Ok(()), buf)));
      return;
    }

    let Some(scratch) = inner.read_scratch.lend() else {
      let err = Error::busy(ErrorKind::Read, "a read is already in flight");
      inner.handle.schedule(move || cb((Err(err), buf)));
      return;
    };

    let op = ReadOp {
      conn: Arc::clone(inner),
      chain: ReadChain::new(buf, len),
      scratch,
      cb,
    };
    inner.handle.schedule(move || op.drive());
  }

  /// Sends all of `data`, in chunks of at most the configured chunk size.
  ///
  /// Success means every byte was handed to the kernel. The first failing
  /// send aborts the write and is reported as is.
  pub fn write<B, F>(&self, data: B, cb: F)
  where
    B: AsRef<[u8]> + Send + 'static,
    F: FnOnce(Result<()>) + Send + 'static,
  {
    let inner = &self.inner;
    if data.as_ref().is_empty() {
      inner.handle.schedule(move || cb(Ok(())));
      return;
    }

    let Some(scratch) = inner.write_scratch.lend() else {
      let err = Error::busy(ErrorKind::Write, "a write is already in flight");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    };

    inner.observe(|o| o.write_started(inner.id, data.as_ref()));
    let op = WriteOp {
      conn: Arc::clone(inner),
      chain: WriteChain::new(data),
      scratch,
      cb,
    };
    inner.handle.schedule(move || op.drive());
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.inner.socket()?.local_addr().map_err(|e| Error::new(ErrorKind::SocketClosed, e))
  }

  pub fn peer_addr(&self) -> Result<SocketAddr> {
    self.inner.socket()?.peer_addr().map_err(|e| Error::new(ErrorKind::SocketClosed, e))
  }

  pub fn shutdown(&self, how: Shutdown) -> Result<()> {
    self.inner.socket()?.shutdown(how).map_err(|e| Error::new(ErrorKind::SocketClosed, e))
  }

  /// Closes the socket. Pending operations, a connect still in progress
  /// included, fail with [`ErrorKind::SocketClosed`], and so does any later
  /// connect.
  pub fn close(&self) {
    let dialing = match mem::replace(&mut *self.inner.dial.lock(), Dial::Closed) {
      Dial::InProgress(source) => Some(source),
      Dial::Idle | Dial::Closed => None,
    };
    if let Some(source) = dialing {
      tracing::debug!(id = %self.inner.id, "aborting connect");
      source.close();
    }
    if let Some(socket) = self.inner.socket.get() {
      tracing::debug!(id = %self.inner.id, "closing");
      socket.close();
    }
  }

  /// Connected, not closed and not known to be broken.
  pub fn is_open(&self) -> bool {
    self.inner.socket.get().is_some_and(Socket::is_open)
  }
}

impl std::fmt::Debug for StreamConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamConnection")
      .field("id", &self.inner.id)
      .field("open", &self.is_open())
      .finish()
  }
}

impl StreamInner {
  fn observe(&self, f: impl FnOnce(&dyn Observer)) {
    if let Some(observer) = self.config.get_observer() {
      f(observer.as_ref());
    }
  }

  /// The socket, if connected and usable.
  fn socket(&self) -> Result<&Socket> {
    match self.socket.get() {
      None => Err(Error::from_errno(ErrorKind::SocketClosed, libc::ENOTCONN)),
      Some(socket) if !socket.is_open() => Err(Error::closed()),
      Some(socket) => Ok(socket),
    }
  }

  fn connect_done<F>(
    &self,
    connected: Option<(Socket, SocketAddr)>,
    result: Result<()>,
    cb: F,
  ) where
    F: FnOnce(Result<()>),
  {
    let closed = {
      let mut dial = self.dial.lock();
      if matches!(*dial, Dial::InProgress(_)) {
        *dial = Dial::Idle;
      }
      matches!(*dial, Dial::Closed)
    };
    let result = match (result, connected) {
      // Closed just as the connect went through.
      (Ok(()), Some(_)) if closed => Err(Error::closed()),
      (Ok(()), Some((socket, addr))) => match self.socket.set(socket) {
        Ok(()) => {
          tracing::debug!(id = %self.id, %addr, "connected");
          self.observe(|o| o.connected(self.id, addr));
          Ok(())
        }
        Err(_) => Err(Error::from_errno(ErrorKind::Connect, libc::EISCONN)),
      },
      (Ok(()), None) => Err(Error::from_errno(ErrorKind::Connect, libc::ENOTCONN)),
      (Err(err), _) => {
        tracing::debug!(id = %self.id, %err, "connect failed");
        self.observe(|o| o.failed(self.id, &err));
        Err(err)
      }
    };
    self.connecting.store(false, Ordering::Release);
    cb(result);
  }
}

struct ReadOp<B, F> {
  conn: Arc<StreamInner>,
  chain: ReadChain<B>,
  scratch: Box<Vec<u8>>,
  cb: F,
}

impl<B, F> ReadOp<B, F>
where
  B: AsMut<[u8]> + Send + 'static,
  F: FnOnce(BufResult<(), B>) + Send + 'static,
{
  fn drive(mut self) {
    loop {
      let Some(len) = self.chain.next_request(&self.conn.policy) else {
        return self.finish(Ok(()));
      };
      let socket = match self.conn.socket() {
        Ok(socket) => socket,
        Err(err) => return self.fail(err),
      };

      match socket.recv(&mut self.scratch[..len]) {
        Ok(0) => {
          let err = Error::eof(self.chain.filled(), self.chain.expected());
          return self.fail(err);
        }
        Ok(n) => {
          let chunk = &self.scratch[..n];
          self.conn.observe(|o| o.read_chunk(self.conn.id, chunk));
          let step = self.chain.complete_chunk(chunk);
          tracing::trace!(
            id = %self.conn.id,
            n,
            filled = self.chain.filled(),
            expected = self.chain.expected(),
            "read chunk"
          );
          if step == Step::Done {
            return self.finish(Ok(()));
          }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          let source = Arc::clone(socket.source());
          source.park_read(Box::new(move |readiness| self.resume(readiness)));
          return;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          if is_broken(&err) {
            socket.mark_broken();
          }
          return self.fail(Error::new(ErrorKind::Read, err));
        }
      }
    }
  }

  fn resume(self, readiness: Readiness) {
    match readiness {
      Readiness::Ready => self.drive(),
      Readiness::Closed => self.fail(Error::closed()),
      Readiness::Failed(err) => self.fail(Error::new(ErrorKind::Read, err)),
    }
  }

  fn fail(mut self, err: Error) {
    self.chain.fail();
    tracing::debug!(id = %self.conn.id, %err, "read failed");
    self.conn.observe(|o| o.failed(self.conn.id, &err));
    self.finish(Err(err));
  }

  fn finish(self, result: Result<()>) {
    let Self { conn, mut chain, scratch, cb } = self;
    conn.read_scratch.give_back(scratch);
    if result.is_ok() {
      conn.observe(|o| o.read_complete(conn.id, chain.target()));
    }
    cb((result, chain.into_target()));
  }
}

struct WriteOp<B, F> {
  conn: Arc<StreamInner>,
  chain: WriteChain<B>,
  scratch: Box<Vec<u8>>,
  cb: F,
}

impl<B, F> WriteOp<B, F>
where
  B: AsRef<[u8]> + Send + 'static,
  F: FnOnce(Result<()>) + Send + 'static,
{
  fn drive(mut self) {
    loop {
      let Some(len) = self.chain.stage(&self.conn.policy, &mut self.scratch) else {
        return self.finish(Ok(()));
      };
      let socket = match self.conn.socket() {
        Ok(socket) => socket,
        Err(err) => return self.fail(err),
      };

      match socket.send(&self.scratch[..len]) {
        Ok(0) => {
          let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes");
          return self.fail(Error::new(ErrorKind::Write, err));
        }
        Ok(n) => {
          self.conn.observe(|o| o.write_chunk(self.conn.id, &self.scratch[..n]));
          let step = self.chain.advance(n);
          tracing::trace!(
            id = %self.conn.id,
            n,
            sent = self.chain.sent(),
            total = self.chain.total(),
            "wrote chunk"
          );
          if step == Step::Done {
            return self.finish(Ok(()));
          }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          let source = Arc::clone(socket.source());
          source.park_write(Box::new(move |readiness| self.resume(readiness)));
          return;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          if is_broken(&err) {
            socket.mark_broken();
          }
          return self.fail(Error::new(ErrorKind::Write, err));
        }
      }
    }
  }

  fn resume(self, readiness: Readiness) {
    match readiness {
      Readiness::Ready => self.drive(),
      Readiness::Closed => self.fail(Error::closed()),
      Readiness::Failed(err) => self.fail(Error::new(ErrorKind::Write, err)),
    }
  }

  fn fail(mut self, err: Error) {
    self.chain.fail();
    tracing::debug!(id = %self.conn.id, sent = self.chain.sent(), %err, "write failed");
    self.conn.observe(|o| o.failed(self.conn.id, &err));
    self.finish(Err(err));
  }

  fn finish(self, result: Result<()>) {
    let Self { conn, scratch, cb, .. } = self;
    conn.write_scratch.give_back(scratch);
    cb(result);
  }
}
