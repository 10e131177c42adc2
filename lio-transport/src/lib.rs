#![cfg_attr(docsrs, feature(doc_cfg))]

//! # lio-transport - callback-driven TCP and UDP on a shared reactor
//!
//! Connection-oriented and connectionless socket wrappers plus a
//! multi-threaded accept loop, all driven by one epoll-based [`EventLoop`].
//! Every operation takes a completion callback that runs on one of the
//! loop's worker threads.
//!
//! ## Features
//! - **Exact reads.** [`StreamConnection::read`] delivers exactly the
//!   requested number of bytes, however the network fragments them.
//! - **Full writes.** [`StreamConnection::write`] sends every byte or reports
//!   the first error; never a silent partial send.
//! - **Bounded syscalls.** Both directions move data in chunks of at most
//!   [`ConnectionConfig::chunk_size`] bytes through per-connection scratch
//!   buffers.
//! - **Datagram boundaries.** [`DatagramConnection::read`] yields one whole
//!   datagram per call.
//! - **Worker pools.** A [`Listener`] drives its loop with a configurable
//!   number of OS threads and hands each accepted connection to a handler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lio_transport::{EventLoop, StreamConnection, Workers};
//!
//! let event_loop = EventLoop::new()?;
//! let workers = Workers::spawn(event_loop.handle(), 2)?;
//!
//! let conn = StreamConnection::new(&event_loop.handle());
//! let client = conn.clone();
//! conn.connect("example.com", 80, move |res| {
//!   if res.is_err() {
//!     return;
//!   }
//!   let reader = client.clone();
//!   client.write(b"HEAD / HTTP/1.0\r\n\r\n".to_vec(), move |res| {
//!     if res.is_ok() {
//!       reader.read(12, |status| println!("{status:?}"));
//!     }
//!   });
//! });
//!
//! // ...
//! event_loop.handle().stop();
//! workers.join();
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Lifetimes
//!
//! Connections are cheap handles around shared state. A pending operation
//! holds its connection alive, so callers may drop their handles at any time.
//! Dropping the [`EventLoop`] itself discards everything still pending
//! without running it.
//!
//! ## Errors
//!
//! Every failure is an [`Error`]: an [`ErrorKind`] naming the step that
//! failed plus the underlying [`std::io::Error`]. Nothing is retried; each
//! error reaches exactly one callback.
//!
//! ## Platform support
//!
//! Linux only (epoll and eventfd).

#[cfg(not(linux))]
compile_error!("lio-transport only supports Linux (epoll)");

#[macro_use]
mod macros;

pub mod chunk;
mod config;
mod error;
pub mod net;
mod net_utils;
pub mod observer;
mod reactor;
mod resolve;
mod sync;

pub use config::{
  ConnectionConfig, DEFAULT_BACKLOG, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DATAGRAM_SIZE,
  DEFAULT_WORKERS, ListenerConfig,
};
pub use error::{BufResult, Error, ErrorKind, Result};
pub use net::{ConnectionId, DatagramConnection, Listener, Shutdown, StreamConnection};
pub use reactor::{EventLoop, Handle, Workers};
