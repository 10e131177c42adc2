mod common;

use std::{
  io::{self, Read, Write},
  net::{TcpListener, TcpStream},
  os::fd::AsRawFd,
  sync::{Arc, mpsc},
  time::Duration,
};

use common::{Rig, Tally, assert_silent, connected_pair, payload, recv, write_in_pieces};
use lio_transport::{
  ConnectionConfig, ErrorKind, EventLoop, Shutdown, StreamConnection, Workers,
};

/// Makes dropping `peer` send a reset instead of a clean close.
fn reset_on_drop(peer: &TcpStream) {
  let linger = libc::linger { l_onoff: 1, l_linger: 0 };
  let rc = unsafe {
    libc::setsockopt(
      peer.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_LINGER,
      (&linger as *const libc::linger).cast::<libc::c_void>(),
      std::mem::size_of::<libc::linger>() as libc::socklen_t,
    )
  };
  assert_eq!(rc, 0, "{}", io::Error::last_os_error());
}
use proptest::prelude::*;

#[test]
fn test_read_exact_across_fragments() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.read(10, move |res| tx.send(res).unwrap());

  write_in_pieces(&mut peer, b"0123456789", &[3, 4, 9]);
  assert_eq!(recv(&rx).unwrap(), b"0123456789");
  assert_silent(&rx);
}

#[test]
fn test_read_leaves_the_rest_for_the_next_read() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());
  peer.write_all(b"headerbody!").unwrap();

  let (tx, rx) = mpsc::channel();
  let tx2 = tx.clone();
  conn.read(6, move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap(), b"header");
  conn.read(5, move |res| tx2.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap(), b"body!");
}

#[test]
fn test_write_2500_bytes_in_1024_byte_chunks() {
  let rig = Rig::new(2);
  let tally = Tally::new();
  let config = ConnectionConfig::new().chunk_size(1024).observer(tally.clone());
  let (conn, mut peer) = connected_pair(&rig.handle(), config);

  let data = payload(2500);
  let (tx, rx) = mpsc::channel();
  conn.write(data.clone(), move |res| tx.send(res).unwrap());

  let mut got = vec![0; 2500];
  peer.read_exact(&mut got).unwrap();
  recv(&rx).expect("write");
  assert_silent(&rx);

  assert_eq!(got, data);
  assert!(Tally::get(&tally.write_chunks) >= 3);
  assert!(Tally::get(&tally.largest_write_chunk) <= 1024);
}

#[test]
fn test_large_read_is_split_into_bounded_chunks() {
  let rig = Rig::new(2);
  let tally = Tally::new();
  let config = ConnectionConfig::new().chunk_size(1024).observer(tally.clone());
  let (conn, mut peer) = connected_pair(&rig.handle(), config);

  let data = payload(2500);
  peer.write_all(&data).unwrap();

  let (tx, rx) = mpsc::channel();
  conn.read(2500, move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap(), data);

  assert!(Tally::get(&tally.read_chunks) >= 3);
  assert!(Tally::get(&tally.largest_read_chunk) <= 1024);
  assert_eq!(Tally::get(&tally.read_completes), 1);
}

#[test]
fn test_write_larger_than_socket_buffer() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new().chunk_size(64 * 1024));

  // Big enough to fill the kernel buffers and force the write to park.
  let data = payload(8 * 1024 * 1024);
  let (tx, rx) = mpsc::channel();
  conn.write(data.clone(), move |res| tx.send(res).unwrap());

  let mut got = vec![0; data.len()];
  peer.read_exact(&mut got).unwrap();
  recv(&rx).expect("write");
  assert!(got == data);
}

#[test]
fn test_peer_close_mid_read_fails_once() {
  let rig = Rig::new(2);
  let tally = Tally::new();
  let (conn, mut peer) =
    connected_pair(&rig.handle(), ConnectionConfig::new().observer(tally.clone()));

  let (tx, rx) = mpsc::channel();
  conn.read(10, move |res| tx.send(res).unwrap());
  peer.write_all(b"abc").unwrap();
  drop(peer);

  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Read);
  assert_eq!(err.io_kind(), io::ErrorKind::UnexpectedEof);
  assert_silent(&rx);
  assert_eq!(Tally::get(&tally.failures), 1);
}

#[test]
fn test_read_into_hands_the_buffer_back() {
  let rig = Rig::new(1);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());
  peer.write_all(b"12345678").unwrap();

  let (tx, rx) = mpsc::channel();
  conn.read_into(8, vec![0xAAu8; 16], move |res| tx.send(res).unwrap());
  let (res, buf) = recv(&rx);
  res.unwrap();
  assert_eq!(&buf[..8], b"12345678");
  assert!(buf[8..].iter().all(|&b| b == 0xAA));
}

#[test]
fn test_read_into_short_buffer_is_invalid_input() {
  let rig = Rig::new(1);
  let (conn, _peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.read_into(8, [0u8; 4], move |res| tx.send(res).unwrap());
  let (res, buf) = recv(&rx);
  let err = res.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Read);
  assert_eq!(err.io_kind(), io::ErrorKind::InvalidInput);
  assert_eq!(buf, [0u8; 4]);
}

#[test]
fn test_zero_length_operations_complete_immediately() {
  let rig = Rig::new(1);
  // Not even connected: nothing touches the socket.
  let conn = StreamConnection::new(&rig.handle());

  let (tx, rx) = mpsc::channel();
  conn.read(0, move |res| tx.send(res).unwrap());
  assert!(recv(&rx).unwrap().is_empty());

  let (tx, rx) = mpsc::channel();
  conn.write(Vec::new(), move |res| tx.send(res).unwrap());
  recv(&rx).unwrap();
}

#[test]
fn test_second_read_while_one_is_pending_is_busy() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (first_tx, first_rx) = mpsc::channel();
  let (second_tx, second_rx) = mpsc::channel();
  conn.read(4, move |res| first_tx.send(res).unwrap());
  conn.read(4, move |res| second_tx.send(res).unwrap());

  let err = recv(&second_rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Read);
  assert_eq!(err.io_kind(), io::ErrorKind::ResourceBusy);

  // The first read is undisturbed.
  peer.write_all(b"ping").unwrap();
  assert_eq!(recv(&first_rx).unwrap(), b"ping");
}

#[test]
fn test_second_write_while_one_is_pending_is_busy() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  // Far more than the socket buffers hold, so the first write is still
  // going when the second arrives.
  let data = payload(4 << 20);
  let (first_tx, first_rx) = mpsc::channel();
  let (second_tx, second_rx) = mpsc::channel();
  conn.write(data.clone(), move |res| first_tx.send(res).unwrap());
  conn.write(b"cut in".to_vec(), move |res| second_tx.send(res).unwrap());

  let err = recv(&second_rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Write);
  assert_eq!(err.io_kind(), io::ErrorKind::ResourceBusy);

  // The first write is undisturbed and nothing else is interleaved.
  let mut got = vec![0; data.len()];
  peer.read_exact(&mut got).unwrap();
  recv(&first_rx).unwrap();
  assert!(got == data);
}

#[test]
fn test_reset_by_peer_breaks_the_connection() {
  let rig = Rig::new(2);
  let (conn, peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.read(4, move |res| tx.send(res).unwrap());
  reset_on_drop(&peer);
  drop(peer);

  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Read);
  assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
  assert!(err.is_fatal());
  assert!(!conn.is_open());

  // Later operations fail straight away without touching the socket.
  let (tx, rx) = mpsc::channel();
  conn.write(b"after".to_vec(), move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap_err().kind(), ErrorKind::SocketClosed);

  let (tx, rx) = mpsc::channel();
  conn.read(1, move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap_err().kind(), ErrorKind::SocketClosed);
  assert_eq!(conn.peer_addr().unwrap_err().kind(), ErrorKind::SocketClosed);
}

#[test]
fn test_close_before_connect_starts_aborts_it() {
  common::init_tracing();
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.set_nonblocking(true).unwrap();
  let port = listener.local_addr().unwrap().port();

  // No workers yet, so the connect is still queued when close runs.
  let event_loop = EventLoop::new().unwrap();
  let conn = StreamConnection::new(&event_loop.handle());
  let (tx, rx) = mpsc::channel();
  conn.connect("127.0.0.1", port, move |res| tx.send(res).unwrap());
  conn.close();

  let workers = Workers::spawn(event_loop.handle(), 1).unwrap();
  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketClosed);
  assert!(!conn.is_open());

  // A closed connection stays closed.
  let (tx, rx) = mpsc::channel();
  conn.connect("127.0.0.1", port, move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap_err().kind(), ErrorKind::SocketClosed);

  std::thread::sleep(Duration::from_millis(50));
  assert_eq!(listener.accept().unwrap_err().kind(), io::ErrorKind::WouldBlock);

  event_loop.handle().stop();
  workers.join();
}

#[test]
fn test_close_aborts_connect_in_progress() {
  let rig = Rig::new(2);
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();

  // Shrink the accept queue to one entry and fill it: further SYNs are
  // dropped, so the next connect stays in progress.
  assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 0) }, 0);
  let _queued = TcpStream::connect(addr).unwrap();
  let _overflow = TcpStream::connect_timeout(&addr, Duration::from_millis(200));

  let conn = StreamConnection::new(&rig.handle());
  let (tx, rx) = mpsc::channel();
  conn.connect("127.0.0.1", addr.port(), move |res| tx.send(res).unwrap());
  assert_silent(&rx);

  conn.close();
  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketClosed);
  assert!(!conn.is_open());
  assert_silent(&rx);
}

#[test]
fn test_close_fails_pending_read() {
  let rig = Rig::new(2);
  let (conn, _peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.read(4, move |res| tx.send(res).unwrap());
  std::thread::sleep(std::time::Duration::from_millis(50));
  conn.close();

  let err = recv(&rx).unwrap_err();
  assert!(err.is_fatal(), "{err}");
  assert!(!conn.is_open());

  let (tx, rx) = mpsc::channel();
  conn.write(b"late".to_vec(), move |res| tx.send(res).unwrap());
  assert_eq!(recv(&rx).unwrap_err().kind(), ErrorKind::SocketClosed);
}

#[test]
fn test_io_before_connect_is_not_connected() {
  let rig = Rig::new(1);
  let conn = StreamConnection::new(&rig.handle());
  assert!(!conn.is_open());

  let (tx, rx) = mpsc::channel();
  conn.read(3, move |res| tx.send(res).unwrap());
  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketClosed);
  assert_eq!(err.raw_os_error(), Some(libc::ENOTCONN));

  assert_eq!(conn.local_addr().unwrap_err().kind(), ErrorKind::SocketClosed);
}

#[test]
fn test_connect_refused() {
  let rig = Rig::new(1);
  let port = {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
  };

  let conn = StreamConnection::new(&rig.handle());
  let (tx, rx) = mpsc::channel();
  conn.connect("127.0.0.1", port, move |res| tx.send(res).unwrap());
  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Connect);
  assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
  assert!(!conn.is_open());
}

#[test]
fn test_connect_twice_is_rejected() {
  let rig = Rig::new(1);
  let (conn, _peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.connect("127.0.0.1", 1, move |res| tx.send(res).unwrap());
  let err = recv(&rx).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Connect);
  assert_eq!(err.raw_os_error(), Some(libc::EISCONN));
}

#[test]
fn test_addresses_and_shutdown() {
  let rig = Rig::new(1);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  assert_eq!(conn.peer_addr().unwrap(), peer.local_addr().unwrap());
  assert_eq!(conn.local_addr().unwrap(), peer.peer_addr().unwrap());

  conn.shutdown(Shutdown::Write).unwrap();
  let mut rest = Vec::new();
  peer.read_to_end(&mut rest).unwrap();
  assert!(rest.is_empty());
}

#[test]
fn test_pending_read_keeps_the_connection_alive() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  let (tx, rx) = mpsc::channel();
  conn.read(5, move |res| tx.send(res).unwrap());
  drop(conn);

  peer.write_all(b"still").unwrap();
  assert_eq!(recv(&rx).unwrap(), b"still");
}

#[test]
fn test_callbacks_can_chain_further_io() {
  let rig = Rig::new(2);
  let (conn, mut peer) = connected_pair(&rig.handle(), ConnectionConfig::new());

  // Length-prefixed message: read the 2-byte header, then the body.
  let (tx, rx) = mpsc::channel();
  let reader = conn.clone();
  conn.read(2, move |header| {
    let header = header.unwrap();
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    reader.read(len, move |body| tx.send(body).unwrap());
  });

  let body = payload(3000);
  let mut framed = (body.len() as u16).to_be_bytes().to_vec();
  framed.extend_from_slice(&body);
  write_in_pieces(&mut peer, &framed, &[1, 700, 2048]);

  assert_eq!(recv(&rx).unwrap(), body);
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(16))]

  #[test]
  fn test_any_fragmentation_yields_one_exact_read(
    len in 1usize..4096,
    cuts in proptest::collection::vec(0usize..4096, 0..6),
    chunk_size in 1usize..2048,
  ) {
    let rig = Rig::new(2);
    let config = ConnectionConfig::new().chunk_size(chunk_size);
    let (conn, mut peer) = connected_pair(&rig.handle(), config);

    let data = payload(len);
    let mut cuts = cuts;
    cuts.sort_unstable();

    let (tx, rx) = mpsc::channel();
    conn.read(len, move |res| tx.send(res).unwrap());
    write_in_pieces(&mut peer, &data, &cuts);

    let got = recv(&rx).unwrap();
    prop_assert_eq!(got, data);
    prop_assert!(rx.try_recv().is_err());
  }
}

#[test]
fn test_observer_is_shared_between_connections() {
  let rig = Rig::new(2);
  let tally = Tally::new();
  let config = ConnectionConfig::new().observer(tally.clone() as Arc<dyn lio_transport::observer::Observer>);
  let (a, mut pa) = connected_pair(&rig.handle(), config.clone());
  let (b, mut pb) = connected_pair(&rig.handle(), config);

  let (tx, rx) = mpsc::channel();
  let tx2 = tx.clone();
  a.read(1, move |res| tx.send(res).unwrap());
  b.read(1, move |res| tx2.send(res).unwrap());
  pa.write_all(b"a").unwrap();
  pb.write_all(b"b").unwrap();
  recv(&rx).unwrap();
  recv(&rx).unwrap();

  assert_eq!(Tally::get(&tally.read_completes), 2);
  assert_ne!(a.id(), b.id());
}
