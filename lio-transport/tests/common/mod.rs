#![allow(dead_code)]

use std::{
  io::Write,
  net::{SocketAddr, TcpListener, TcpStream},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::Receiver,
  },
  time::Duration,
};

use lio_transport::{
  ConnectionConfig, ConnectionId, EventLoop, Handle, StreamConnection, Workers,
  observer::Observer,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// An event loop with its own worker threads, stopped and joined on drop.
pub struct Rig {
  event_loop: EventLoop,
  workers: Option<Workers>,
}

impl Rig {
  pub fn new(workers: usize) -> Self {
    init_tracing();
    let event_loop = EventLoop::new().expect("event loop");
    let workers = Workers::spawn(event_loop.handle(), workers).expect("workers");
    Self { event_loop, workers: Some(workers) }
  }

  pub fn handle(&self) -> Handle {
    self.event_loop.handle()
  }
}

impl Drop for Rig {
  fn drop(&mut self) {
    self.event_loop.handle().stop();
    if let Some(workers) = self.workers.take() {
      workers.join();
    }
  }
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
  rx.recv_timeout(TIMEOUT).expect("callback was not invoked within timeout")
}

/// Asserts nothing more arrives for a little while.
pub fn assert_silent<T: std::fmt::Debug>(rx: &Receiver<T>) {
  if let Ok(extra) = rx.recv_timeout(Duration::from_millis(200)) {
    panic!("unexpected extra callback: {extra:?}");
  }
}

/// Connects a [`StreamConnection`] to a blocking std peer.
pub fn connected_pair(
  handle: &Handle,
  config: ConnectionConfig,
) -> (StreamConnection, TcpStream) {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();

  let conn = StreamConnection::with_config(handle, config);
  let (tx, rx) = std::sync::mpsc::channel();
  conn.connect("127.0.0.1", port, move |res| tx.send(res).unwrap());

  let (peer, _) = listener.accept().unwrap();
  recv(&rx).expect("connect");
  peer.set_read_timeout(Some(TIMEOUT)).unwrap();
  (conn, peer)
}

pub fn payload(len: usize) -> Vec<u8> {
  let mut rng = fastrand::Rng::with_seed(len as u64);
  (0..len).map(|_| rng.u8(..)).collect()
}

/// Writes `data` in the given pieces, flushing each so the reader sees them
/// arrive separately.
pub fn write_in_pieces(peer: &mut TcpStream, data: &[u8], cuts: &[usize]) {
  let mut start = 0;
  for &cut in cuts.iter().chain(std::iter::once(&data.len())) {
    let end = cut.clamp(start, data.len());
    peer.write_all(&data[start..end]).unwrap();
    peer.flush().unwrap();
    start = end;
    std::thread::sleep(Duration::from_millis(2));
  }
}

pub fn loopback(port: u16) -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], port))
}

/// Observer that tallies what it is shown.
#[derive(Default)]
pub struct Tally {
  pub read_chunks: AtomicUsize,
  pub largest_read_chunk: AtomicUsize,
  pub read_completes: AtomicUsize,
  pub write_chunks: AtomicUsize,
  pub largest_write_chunk: AtomicUsize,
  pub failures: AtomicUsize,
}

impl Tally {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn get(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
  }
}

impl Observer for Tally {
  fn read_chunk(&self, _id: ConnectionId, chunk: &[u8]) {
    self.read_chunks.fetch_add(1, Ordering::SeqCst);
    self.largest_read_chunk.fetch_max(chunk.len(), Ordering::SeqCst);
  }

  fn read_complete(&self, _id: ConnectionId, _data: &[u8]) {
    self.read_completes.fetch_add(1, Ordering::SeqCst);
  }

  fn write_chunk(&self, _id: ConnectionId, chunk: &[u8]) {
    self.write_chunks.fetch_add(1, Ordering::SeqCst);
    self.largest_write_chunk.fetch_max(chunk.len(), Ordering::SeqCst);
  }

  fn failed(&self, _id: ConnectionId, _error: &lio_transport::Error) {
    self.failures.fetch_add(1, Ordering::SeqCst);
  }
}
