use std::{
  io,
  net::SocketAddr,
  sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
  },
};

use super::{ConnectionId, Socket, Transport};
use crate::{
  ConnectionConfig, Error, ErrorKind, Result,
  chunk::ChunkPolicy,
  error::is_broken,
  observer::Observer,
  reactor::{Handle, Readiness},
  resolve,
};

/// A connectionless socket. One read yields exactly one datagram; one write
/// sends exactly one.
///
/// "Connecting" only sets the default peer: sends go there and receives are
/// filtered to it. As with [`StreamConnection`](super::StreamConnection) at
/// most one read and one write may be in flight.
#[derive(Clone)]
pub struct DatagramConnection {
  inner: Arc<DatagramInner>,
}

struct DatagramInner {
  id: ConnectionId,
  handle: Handle,
  config: ConnectionConfig,
  policy: ChunkPolicy,
  socket: OnceLock<Socket>,
  connecting: AtomicBool,
  reading: AtomicBool,
  writing: AtomicBool,
}

impl DatagramConnection {
  /// An unbound connection; the socket is opened by
  /// [`connect`](Self::connect).
  pub fn new(handle: &Handle) -> Self {
    Self::with_config(handle, ConnectionConfig::default())
  }

  pub fn with_config(handle: &Handle, config: ConnectionConfig) -> Self {
    Self {
      inner: Arc::new(DatagramInner {
        id: ConnectionId::next(Transport::Datagram),
        handle: handle.clone(),
        policy: ChunkPolicy::new(config.get_max_datagram_size()),
        config,
        socket: OnceLock::new(),
        connecting: AtomicBool::new(false),
        reading: AtomicBool::new(false),
        writing: AtomicBool::new(false),
      }),
    }
  }

  /// Opens a socket bound to `addr`. Port 0 picks an ephemeral port.
  pub fn bind(handle: &Handle, addr: SocketAddr) -> Result<Self> {
    Self::bind_with_config(handle, addr, ConnectionConfig::default())
  }

  pub fn bind_with_config(
    handle: &Handle,
    addr: SocketAddr,
    config: ConnectionConfig,
  ) -> Result<Self> {
    let conn = Self::with_config(handle, config);
    let socket = Socket::open_for(handle, &addr, libc::SOCK_DGRAM)
      .and_then(|socket| socket.bind(addr).map(|()| socket))
      .map_err(|e| Error::new(ErrorKind::Connect, e))?;
    let _ = conn.inner.socket.set(socket);
    tracing::debug!(id = %conn.inner.id, %addr, "bound");
    Ok(conn)
  }

  pub fn id(&self) -> ConnectionId {
    self.inner.id
  }

  pub fn config(&self) -> &ConnectionConfig {
    &self.inner.config
  }

  /// Resolves `host` and makes the first endpoint the default peer, opening
  /// the socket first if needed.
  pub fn connect<F>(&self, host: &str, port: u16, cb: F)
  where
    F: FnOnce(Result<()>) + Send + 'static,
  {
    let inner = &self.inner;
    if inner.connecting.swap(true, Ordering::AcqRel) {
      let err = Error::busy(ErrorKind::Connect, "a connect is already in progress");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }

    let this = Arc::clone(inner);
    resolve::resolve(&inner.handle, host, port, move |resolved| {
      let result = resolved.and_then(|addrs| this.set_peer(addrs[0]));
      if let Err(err) = &result {
        this.observe(|o| o.failed(this.id, err));
      }
      this.connecting.store(false, Ordering::Release);
      cb(result);
    });
  }

  /// Receives the next datagram and its sender.
  pub fn read<F>(&self, cb: F)
  where
    F: FnOnce(Result<(SocketAddr, Vec<u8>)>) + Send + 'static,
  {
    let inner = &self.inner;
    if inner.reading.swap(true, Ordering::AcqRel) {
      let err = Error::busy(ErrorKind::Read, "a read is already in flight");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }
    let this = Arc::clone(inner);
    inner.handle.schedule(move || this.drive_read(Box::new(cb)));
  }

  /// Sends `data` as one datagram to the connected peer.
  ///
  /// Payloads over the configured maximum datagram size fail with `EMSGSIZE`
  /// before anything is sent.
  pub fn write<B, F>(&self, data: B, cb: F)
  where
    B: AsRef<[u8]> + Send + 'static,
    F: FnOnce(Result<()>) + Send + 'static,
  {
    self.start_write(None, data, cb);
  }

  /// Sends `data` as one datagram to `addr`.
  pub fn send_to<B, F>(&self, addr: SocketAddr, data: B, cb: F)
  where
    B: AsRef<[u8]> + Send + 'static,
    F: FnOnce(Result<()>) + Send + 'static,
  {
    self.start_write(Some(addr), data, cb);
  }

  fn start_write<B, F>(&self, to: Option<SocketAddr>, data: B, cb: F)
  where
    B: AsRef<[u8]> + Send + 'static,
    F: FnOnce(Result<()>) + Send + 'static,
  {
    let inner = &self.inner;
    let len = data.as_ref().len();
    if !inner.policy.fits(len) {
      let err = Error::new(
        ErrorKind::Write,
        io::Error::from_raw_os_error(libc::EMSGSIZE),
      );
      tracing::debug!(id = %inner.id, len, max = inner.policy.chunk_size(), "datagram too large");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }
    if inner.writing.swap(true, Ordering::AcqRel) {
      let err = Error::busy(ErrorKind::Write, "a write is already in flight");
      inner.handle.schedule(move || cb(Err(err)));
      return;
    }

    let op = SendOp { conn: Arc::clone(inner), to, data, cb };
    inner.handle.schedule(move || op.drive());
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.inner.socket()?.local_addr().map_err(|e| Error::new(ErrorKind::SocketClosed, e))
  }

  pub fn peer_addr(&self) -> Result<SocketAddr> {
    self.inner.socket()?.peer_addr().map_err(|e| Error::new(ErrorKind::SocketClosed, e))
  }

  /// Closes the socket. A pending read fails with
  /// [`ErrorKind::SocketClosed`].
  pub fn close(&self) {
    if let Some(socket) = self.inner.socket.get() {
      tracing::debug!(id = %self.inner.id, "closing");
      socket.close();
    }
  }

  pub fn is_open(&self) -> bool {
    self.inner.socket.get().is_some_and(Socket::is_open)
  }
}

impl std::fmt::Debug for DatagramConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DatagramConnection")
      .field("id", &self.inner.id)
      .field("open", &self.is_open())
      .finish()
  }
}

type ReadCallback = Box<dyn FnOnce(Result<(SocketAddr, Vec<u8>)>) + Send + 'static>;

impl DatagramInner {
  fn observe(&self, f: impl FnOnce(&dyn Observer)) {
    if let Some(observer) = self.config.get_observer() {
      f(observer.as_ref());
    }
  }

  fn socket(&self) -> Result<&Socket> {
    match self.socket.get() {
      None => Err(Error::from_errno(ErrorKind::SocketClosed, libc::ENOTCONN)),
      Some(socket) if !socket.is_open() => Err(Error::closed()),
      Some(socket) => Ok(socket),
    }
  }

  fn set_peer(&self, addr: SocketAddr) -> Result<()> {
    let socket = match self.socket.get() {
      Some(socket) => socket,
      None => {
        let socket = Socket::open_for(&self.handle, &addr, libc::SOCK_DGRAM)
          .map_err(|e| Error::new(ErrorKind::Connect, e))?;
        // Only reached with `connecting` held, so nobody else sets it.
        self.socket.get_or_init(|| socket)
      }
    };
    if !socket.is_open() {
      return Err(Error::closed());
    }

    // Connecting a datagram socket completes immediately.
    socket.connect(addr).map_err(|e| Error::new(ErrorKind::Connect, e))?;
    tracing::debug!(id = %self.id, %addr, "peer set");
    self.observe(|o| o.connected(self.id, addr));
    Ok(())
  }

  fn drive_read(self: Arc<Self>, cb: ReadCallback) {
    loop {
      let socket = match self.socket() {
        Ok(socket) => socket,
        Err(err) => return self.read_done(Err(err), cb),
      };

      // Only one read runs at a time, so the datagram sized here is the one
      // recvfrom takes next.
      let pending = match socket.peek_len() {
        Ok(n) => n,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          return Self::park_read(&self, socket, cb);
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return self.read_failed(socket, err, cb),
      };
      let mut payload = vec![0; pending];

      match socket.recv_from(&mut payload) {
        Ok((n, from)) => {
          debug_assert_eq!(n, pending, "datagram changed between peek and receive");
          payload.truncate(n);
          tracing::trace!(id = %self.id, %from, n, "datagram received");
          self.observe(|o| o.datagram_received(self.id, from, &payload));
          return self.read_done(Ok((from, payload)), cb);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          return Self::park_read(&self, socket, cb);
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return self.read_failed(socket, err, cb),
      }
    }
  }

  fn park_read(this: &Arc<Self>, socket: &Socket, cb: ReadCallback) {
    let this = Arc::clone(this);
    socket.source().park_read(Box::new(move |readiness| match readiness {
      Readiness::Ready => this.drive_read(cb),
      Readiness::Closed => this.read_done(Err(Error::closed()), cb),
      Readiness::Failed(err) => this.read_done(Err(Error::new(ErrorKind::Read, err)), cb),
    }));
  }

  fn read_failed(&self, socket: &Socket, err: io::Error, cb: ReadCallback) {
    if is_broken(&err) {
      socket.mark_broken();
    }
    self.read_done(Err(Error::new(ErrorKind::Read, err)), cb);
  }

  fn read_done(&self, result: Result<(SocketAddr, Vec<u8>)>, cb: ReadCallback) {
    if let Err(err) = &result {
      tracing::debug!(id = %self.id, %err, "datagram read failed");
      self.observe(|o| o.failed(self.id, err));
    }
    self.reading.store(false, Ordering::Release);
    cb(result);
  }
}

struct SendOp<B, F> {
  conn: Arc<DatagramInner>,
  to: Option<SocketAddr>,
  data: B,
  cb: F,
}

impl<B, F> SendOp<B, F>
where
  B: AsRef<[u8]> + Send + 'static,
  F: FnOnce(Result<()>) + Send + 'static,
{
  fn drive(self) {
    loop {
      let socket = match self.conn.socket() {
        Ok(socket) => socket,
        Err(err) => return self.finish(Err(err)),
      };

      let data = self.data.as_ref();
      let sent = match self.to {
        Some(addr) => socket.send_to(data, addr),
        None => socket.send(data),
      };

      match sent {
        Ok(n) => {
          tracing::trace!(id = %self.conn.id, n, "datagram sent");
          self.conn.observe(|o| o.datagram_sent(self.conn.id, data));
          return self.finish(Ok(()));
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          let source = Arc::clone(socket.source());
          source.park_write(Box::new(move |readiness| match readiness {
            Readiness::Ready => self.drive(),
            Readiness::Closed => self.finish(Err(Error::closed())),
            Readiness::Failed(err) => self.finish(Err(Error::new(ErrorKind::Write, err))),
          }));
          return;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          if is_broken(&err) {
            socket.mark_broken();
          }
          return self.finish(Err(Error::new(ErrorKind::Write, err)));
        }
      }
    }
  }

  fn finish(self, result: Result<()>) {
    let Self { conn, cb, .. } = self;
    if let Err(err) = &result {
      tracing::debug!(id = %conn.id, %err, "datagram write failed");
      conn.observe(|o| o.failed(conn.id, err));
    }
    conn.writing.store(false, Ordering::Release);
    cb(result);
  }
}
