//! Host name resolution.
//!
//! `getaddrinfo` blocks, so it never runs on a worker thread. Literal
//! addresses are answered straight away; everything else goes to one
//! background thread per event loop, started on first use, and the answer is
//! scheduled back onto the loop.

use std::{
  io,
  net::{IpAddr, SocketAddr, ToSocketAddrs},
  thread,
};

use crossbeam_channel::Sender;

use crate::{Error, ErrorKind, Result, reactor::Handle};

pub(crate) struct Job {
  host: String,
  port: u16,
  reply: Box<dyn FnOnce(io::Result<Vec<SocketAddr>>) + Send + 'static>,
}

pub(crate) fn spawn_resolver() -> io::Result<Sender<Job>> {
  let (tx, rx) = crossbeam_channel::unbounded::<Job>();
  thread::Builder::new().name("lio-transport-resolver".into()).spawn(move || {
    // Ends once the owning loop, and with it the sender, is gone.
    for job in rx {
      let result =
        (job.host.as_str(), job.port).to_socket_addrs().map(|addrs| addrs.collect());
      (job.reply)(result);
    }
  })?;
  Ok(tx)
}

/// Parses `host` as a literal IPv4 or IPv6 address, with or without brackets.
pub(crate) fn parse_literal(host: &str) -> Option<IpAddr> {
  let trimmed = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  trimmed.parse().ok()
}

/// Resolves `host:port` into candidate endpoints and hands them to `cb` on
/// the loop.
pub(crate) fn resolve<F>(handle: &Handle, host: &str, port: u16, cb: F)
where
  F: FnOnce(Result<Vec<SocketAddr>>) + Send + 'static,
{
  if let Some(ip) = parse_literal(host) {
    handle.schedule(move || cb(Ok(vec![SocketAddr::new(ip, port)])));
    return;
  }

  let resolver = match handle.resolver() {
    Ok(tx) => tx,
    Err(err) => {
      handle.schedule(move || cb(Err(Error::new(ErrorKind::Resolve, err))));
      return;
    }
  };

  tracing::debug!(host, port, "resolving");
  let loop_handle = handle.clone();
  let owned_host = host.to_owned();
  let job = Job {
    host: host.to_owned(),
    port,
    reply: Box::new(move |result| {
      let result = finish(&owned_host, port, result);
      loop_handle.schedule(move || cb(result));
    }),
  };

  if let Err(crossbeam_channel::SendError(job)) = resolver.send(job) {
    let err = io::Error::new(io::ErrorKind::BrokenPipe, "resolver thread is gone");
    (job.reply)(Err(err));
  }
}

fn finish(
  host: &str,
  port: u16,
  result: io::Result<Vec<SocketAddr>>,
) -> Result<Vec<SocketAddr>> {
  match result {
    Ok(addrs) if addrs.is_empty() => Err(Error::new(
      ErrorKind::Resolve,
      io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}:{port}")),
    )),
    Ok(addrs) => {
      tracing::trace!(host, port, count = addrs.len(), "resolved");
      Ok(addrs)
    }
    Err(err) => Err(Error::new(ErrorKind::Resolve, err)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::reactor::{EventLoop, Workers};
  use std::{sync::mpsc, time::Duration};

  #[test]
  fn literals_skip_the_resolver() {
    assert_eq!(parse_literal("127.0.0.1"), Some("127.0.0.1".parse().unwrap()));
    assert_eq!(parse_literal("[::1]"), Some("::1".parse().unwrap()));
    assert_eq!(parse_literal("::1"), Some("::1".parse().unwrap()));
    assert_eq!(parse_literal("localhost"), None);
  }

  #[test]
  fn empty_answer_is_not_found() {
    let err = finish("nowhere", 1, Ok(Vec::new())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolve);
    assert_eq!(err.io_kind(), io::ErrorKind::NotFound);
  }

  #[test]
  fn resolves_literal_and_localhost() {
    let event_loop = EventLoop::new().unwrap();
    let workers = Workers::spawn(event_loop.handle(), 1).unwrap();
    let (tx, rx) = mpsc::channel();

    let tx2 = tx.clone();
    resolve(&event_loop.handle(), "127.0.0.1", 80, move |r| tx2.send(r).unwrap());
    let addrs = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);

    resolve(&event_loop.handle(), "localhost", 8080, move |r| tx.send(r).unwrap());
    let addrs = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert!(addrs.iter().all(|a| a.port() == 8080 && a.ip().is_loopback()));

    event_loop.handle().stop();
    workers.join();
  }
}
