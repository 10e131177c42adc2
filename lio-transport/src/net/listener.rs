use std::{
  io,
  net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
  sync::Arc,
};

use super::{Socket, StreamConnection};
use crate::{
  ConnectionConfig, Error, ErrorKind, ListenerConfig, Result,
  reactor::{EventLoop, Handle, Readiness, Workers},
  resolve,
  sync::Mutex,
};

type Handler = dyn Fn(Result<StreamConnection>) + Send + Sync + 'static;

/// Accepts stream connections on a pool of worker threads.
///
/// The listener owns its event loop. [`start`](Self::start) spawns the
/// workers, binds the acceptor and begins accepting; every accepted
/// connection is passed to the handler, which runs on a worker thread and
/// may issue further I/O on the connection. [`stop`](Self::stop) tears all of
/// that down again, and the listener can then be started anew.
///
/// ```rust,no_run
/// use lio_transport::Listener;
///
/// let mut listener = Listener::new(7000, "127.0.0.1").unwrap();
/// listener
///   .start(|conn| {
///     let Ok(conn) = conn else { return };
///     let echo = conn.clone();
///     conn.read(4, move |data| {
///       if let Ok(data) = data {
///         echo.write(data, |_| {});
///       }
///     });
///   })
///   .unwrap();
/// // ...
/// listener.stop();
/// ```
pub struct Listener {
  config: ListenerConfig,
  event_loop: EventLoop,
  workers: Option<Workers>,
  acceptor: Option<Arc<Acceptor>>,
}

struct Acceptor {
  socket: Mutex<Option<Arc<Socket>>>,
  handler: Mutex<Option<Arc<Handler>>>,
  handle: Handle,
  connection: ConnectionConfig,
  local_addr: SocketAddr,
}

impl Listener {
  /// A listener for `address:port`. An empty address listens on every IPv4
  /// interface.
  pub fn new(port: u16, address: &str) -> io::Result<Self> {
    Self::with_config(ListenerConfig::new(port).address(address))
  }

  pub fn with_config(config: ListenerConfig) -> io::Result<Self> {
    Ok(Self { config, event_loop: EventLoop::new()?, workers: None, acceptor: None })
  }

  /// Sets how many threads drive the loop. Takes effect on the next
  /// [`start`](Self::start).
  ///
  /// # Panics
  ///
  /// Panics if `count` is zero.
  pub fn set_worker_count(&mut self, count: usize) {
    self.config.set_workers(count);
  }

  pub fn config(&self) -> &ListenerConfig {
    &self.config
  }

  pub fn handle(&self) -> Handle {
    self.event_loop.handle()
  }

  pub fn is_running(&self) -> bool {
    self.acceptor.is_some()
  }

  /// The bound address while running. Useful after binding port 0.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.acceptor.as_ref().map(|acceptor| acceptor.local_addr)
  }

  /// Starts the workers, binds the acceptor and begins accepting.
  ///
  /// `handler` receives every accepted connection, and the error that ends
  /// accepting should one occur (accepting is then not resumed). It is never
  /// called once [`stop`](Self::stop) has returned.
  ///
  /// Fails with [`ErrorKind::Accept`] if the listener is already running or
  /// the acceptor cannot be set up; the workers are stopped again in the
  /// latter case.
  pub fn start<H>(&mut self, handler: H) -> Result<()>
  where
    H: Fn(Result<StreamConnection>) + Send + Sync + 'static,
  {
    if self.is_running() {
      return Err(Error::busy(ErrorKind::Accept, "listener is already running"));
    }

    let handle = self.event_loop.handle();
    handle.reset();
    let workers = Workers::spawn(handle.clone(), self.config.worker_count())
      .map_err(|e| Error::new(ErrorKind::Accept, e))?;

    let acceptor = match Acceptor::open(&handle, &self.config, Arc::new(handler)) {
      Ok(acceptor) => Arc::new(acceptor),
      Err(err) => {
        tracing::debug!(%err, "listener setup failed");
        handle.stop();
        workers.join();
        return Err(err);
      }
    };

    tracing::debug!(
      addr = %acceptor.local_addr,
      workers = workers.len(),
      "listener started"
    );

    let first = Arc::clone(&acceptor);
    handle.schedule(move || first.accept_next());
    self.workers = Some(workers);
    self.acceptor = Some(acceptor);
    Ok(())
  }

  /// Stops accepting, stops the loop and joins every worker.
  ///
  /// Must not be called from one of the listener's own workers. Does nothing
  /// if the listener is not running.
  pub fn stop(&mut self) {
    let Some(acceptor) = self.acceptor.take() else {
      return;
    };

    acceptor.close();
    let handle = self.event_loop.handle();
    handle.stop();
    if let Some(workers) = self.workers.take() {
      workers.join();
    }
    // Accept continuations still queued hold the acceptor; make them inert.
    acceptor.release();
    tracing::debug!(addr = %acceptor.local_addr, "listener stopped");
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    self.stop();
  }
}

impl std::fmt::Debug for Listener {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Listener")
      .field("config", &self.config)
      .field("local_addr", &self.local_addr())
      .finish()
  }
}

impl Acceptor {
  fn open(handle: &Handle, config: &ListenerConfig, handler: Arc<Handler>) -> Result<Self> {
    let accept_err = |e: io::Error| Error::new(ErrorKind::Accept, e);
    let addr = bind_address(config.get_address(), config.get_port()).map_err(accept_err)?;

    let socket = Socket::open_for(handle, &addr, libc::SOCK_STREAM).map_err(accept_err)?;
    socket.set_reuse_address().map_err(accept_err)?;
    socket.bind(addr).map_err(accept_err)?;
    socket.listen(config.get_backlog()).map_err(accept_err)?;
    let local_addr = socket.local_addr().map_err(accept_err)?;

    Ok(Self {
      socket: Mutex::new(Some(Arc::new(socket))),
      handler: Mutex::new(Some(handler)),
      handle: handle.clone(),
      connection: config.get_connection().clone(),
      local_addr,
    })
  }

  fn accept_next(self: Arc<Self>) {
    loop {
      let Some(socket) = self.socket.lock().clone() else {
        return;
      };

      match socket.accept() {
        Ok((fd, peer)) => {
          // Keep accepting while this connection is handled.
          let next = Arc::clone(&self);
          self.handle.schedule(move || next.accept_next());

          let conn =
            StreamConnection::from_accepted(&self.handle, self.connection.clone(), fd, peer);
          self.deliver(Ok(conn));
          return;
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          let source = Arc::clone(socket.source());
          let this = Arc::clone(&self);
          source.park_read(Box::new(move |readiness| match readiness {
            Readiness::Ready => this.accept_next(),
            Readiness::Closed => {
              this.deliver(Err(Error::from_errno(ErrorKind::Accept, libc::ECANCELED)))
            }
            Readiness::Failed(err) => this.deliver(Err(Error::new(ErrorKind::Accept, err))),
          }));
          return;
        }
        Err(err)
          if err.kind() == io::ErrorKind::Interrupted
            || err.raw_os_error() == Some(libc::ECONNABORTED) => {}
        Err(err) => {
          if !socket.is_open() {
            // Closed between the lock and the syscall.
            return self.deliver(Err(Error::from_errno(ErrorKind::Accept, libc::ECANCELED)));
          }
          tracing::warn!(addr = %self.local_addr, %err, "accept failed");
          return self.deliver(Err(Error::new(ErrorKind::Accept, err)));
        }
      }
    }
  }

  fn deliver(&self, result: Result<StreamConnection>) {
    let handler = self.handler.lock().clone();
    if let Some(handler) = handler {
      handler(result);
    }
  }

  fn close(&self) {
    if let Some(socket) = self.socket.lock().as_ref() {
      socket.close();
    }
  }

  fn release(&self) {
    let socket = self.socket.lock().take();
    let handler = self.handler.lock().take();
    drop(socket);
    drop(handler);
  }
}

fn bind_address(address: &str, port: u16) -> io::Result<SocketAddr> {
  if address.is_empty() {
    return Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
  }
  if let Some(ip) = resolve::parse_literal(address) {
    return Ok(SocketAddr::new(ip, port));
  }
  (address, port).to_socket_addrs()?.next().ok_or_else(|| {
    io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {address}"))
  })
}
