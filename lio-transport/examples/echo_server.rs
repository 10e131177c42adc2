//! Framed echo server: every client sends a 2-byte big-endian length
//! followed by that many bytes, and gets the same frame back.
//!
//! ```text
//! RUST_LOG=lio_transport=debug cargo run --example echo_server -- 7000
//! ```

use std::sync::Arc;

use lio_transport::{
  ConnectionConfig, ListenerConfig, Listener, StreamConnection, observer::HexDump,
};
use tracing_subscriber::EnvFilter;

fn serve(conn: StreamConnection) {
  let reader = conn.clone();
  conn.read(2, move |header| {
    let header = match header {
      Ok(header) => header,
      Err(err) => return tracing::info!(id = %reader.id(), %err, "client gone"),
    };
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;

    let writer = reader.clone();
    reader.read(len, move |body| {
      let body = match body {
        Ok(body) => body,
        Err(err) => return tracing::info!(id = %writer.id(), %err, "client gone"),
      };
      let mut frame = header;
      frame.extend_from_slice(&body);

      let next = writer.clone();
      writer.write(frame, move |res| match res {
        Ok(()) => serve(next),
        Err(err) => tracing::info!(id = %next.id(), %err, "write failed"),
      });
    });
  });
}

fn main() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .try_init();

  let port = std::env::args().nth(1).and_then(|p| p.parse().ok()).unwrap_or(7000);
  let config = ListenerConfig::new(port)
    .workers(4)
    .connection(ConnectionConfig::new().observer(Arc::new(HexDump::new())));

  let mut listener = match Listener::with_config(config) {
    Ok(listener) => listener,
    Err(err) => {
      eprintln!("failed to create listener: {err}");
      std::process::exit(1);
    }
  };

  let started = listener.start(|conn| match conn {
    Ok(conn) => serve(conn),
    Err(err) => tracing::warn!(%err, "accepting stopped"),
  });
  if let Err(err) = started {
    eprintln!("failed to start: {err}");
    std::process::exit(1);
  }

  tracing::info!(addr = ?listener.local_addr(), "echo server running, press enter to stop");
  let mut line = String::new();
  let _ = std::io::stdin().read_line(&mut line);
  listener.stop();
}
