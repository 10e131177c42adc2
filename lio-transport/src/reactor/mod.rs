//! Multi-threaded readiness reactor.
//!
//! An [`EventLoop`] owns one epoll instance, a task queue and a wake-up
//! notifier. Any number of threads may drive it at once through
//! [`Handle::run`]; each iteration drains a bounded batch of queued tasks and
//! then waits for socket readiness. Readiness is delivered through
//! [`Source`]s, which park at most one read and one write continuation per
//! socket and hand each to exactly one thread when it fires.
//!
//! ```rust
//! use std::sync::mpsc;
//! use lio_transport::{EventLoop, Workers};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let workers = Workers::spawn(event_loop.handle(), 2).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! event_loop.handle().schedule(move || tx.send(42).unwrap());
//! assert_eq!(rx.recv().unwrap(), 42);
//!
//! event_loop.handle().stop();
//! workers.join();
//! ```

mod epoll;
mod interest;
mod source;
mod workers;

pub(crate) use interest::Interest;
pub(crate) use source::{Readiness, Source};
pub use workers::Workers;

use std::{
  collections::HashMap,
  io,
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration,
};

use crossbeam_channel::{Receiver, Sender};

use crate::{resolve, sync::Mutex};
use epoll::{Events, NOTIFY_KEY, OsPoller};

/// A unit of work queued on the loop.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Tasks run per iteration before the loop polls for readiness again, so a
/// busy queue cannot starve socket events.
const TASK_BATCH: usize = 64;

pub(crate) struct Shared {
  poller: OsPoller,
  sources: Mutex<HashMap<u64, Weak<Source>>>,
  next_token: AtomicU64,
  tasks_tx: Sender<Task>,
  tasks_rx: Receiver<Task>,
  stopped: AtomicBool,
  resolver: Mutex<Option<Sender<resolve::Job>>>,
}

/// Owner of the event loop.
///
/// Dropping it stops every thread running the loop and discards queued tasks
/// and parked continuations without running them.
pub struct EventLoop {
  handle: Handle,
}

/// Cheap, cloneable reference to an [`EventLoop`].
#[derive(Clone)]
pub struct Handle {
  shared: Arc<Shared>,
}

impl EventLoop {
  pub fn new() -> io::Result<Self> {
    let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
    let shared = Shared {
      poller: OsPoller::new()?,
      sources: Mutex::new(HashMap::new()),
      next_token: AtomicU64::new(0),
      tasks_tx,
      tasks_rx,
      stopped: AtomicBool::new(false),
      resolver: Mutex::new(None),
    };
    Ok(Self { handle: Handle { shared: Arc::new(shared) } })
  }

  pub fn handle(&self) -> Handle {
    self.handle.clone()
  }
}

impl Drop for EventLoop {
  fn drop(&mut self) {
    self.handle.stop();
    self.handle.discard();
  }
}

impl std::fmt::Debug for EventLoop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLoop").field("handle", &self.handle).finish()
  }
}

impl std::fmt::Debug for Handle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Handle")
      .field("stopped", &self.is_stopped())
      .field("queued", &self.shared.tasks_rx.len())
      .finish()
  }
}

impl Handle {
  /// Queues `task`. Whichever thread runs the loop next picks it up.
  pub fn schedule<F>(&self, task: F)
  where
    F: FnOnce() + Send + 'static,
  {
    // The receiver lives as long as `shared`, so this cannot fail.
    let _ = self.shared.tasks_tx.send(Box::new(task));
    self.shared.poller.notify();
  }

  /// Runs tasks and readiness continuations on the calling thread until
  /// [`stop`](Self::stop) is called.
  pub fn run(&self) {
    let mut events = Events::default();

    while !self.is_stopped() {
      self.run_tasks();
      if self.is_stopped() {
        break;
      }

      let timeout =
        if self.shared.tasks_rx.is_empty() { None } else { Some(Duration::ZERO) };
      if let Err(err) = self.shared.poller.wait(&mut events, timeout) {
        tracing::error!(%err, "epoll_wait failed, leaving event loop");
        break;
      }

      for (key, interest) in events.iter() {
        if key == NOTIFY_KEY {
          // Left set while stopped so every thread sees it.
          if !self.is_stopped() {
            self.shared.poller.clear_notify();
          }
          continue;
        }
        self.dispatch(key, interest);
      }
    }
  }

  /// Makes every [`run`](Self::run) call return. Queued work is kept.
  pub fn stop(&self) {
    self.shared.stopped.store(true, Ordering::Release);
    self.shared.poller.notify();
  }

  /// Allows the loop to be run again after [`stop`](Self::stop).
  pub fn reset(&self) {
    self.shared.stopped.store(false, Ordering::Release);
    self.shared.poller.clear_notify();
    // Work queued while stopped still needs a thread to notice it.
    if !self.shared.tasks_rx.is_empty() {
      self.shared.poller.notify();
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.shared.stopped.load(Ordering::Acquire)
  }

  fn run_tasks(&self) {
    for _ in 0..TASK_BATCH {
      let Ok(task) = self.shared.tasks_rx.try_recv() else {
        return;
      };
      run_guarded(task);
    }
  }

  fn dispatch(&self, key: u64, interest: Interest) {
    let source = self.shared.sources.lock().get(&key).and_then(Weak::upgrade);
    match source {
      Some(source) => source.on_ready(interest),
      None => tracing::trace!(key, "readiness for a dropped source"),
    }
  }

  /// Drops every queued task and parked continuation without running it.
  fn discard(&self) {
    let mut dropped = 0usize;
    loop {
      // Dropping a task or continuation may release a connection, and a
      // closing connection hands its continuations back as new tasks.
      let tasks: Vec<Task> = self.shared.tasks_rx.try_iter().collect();
      let mut round = tasks.len();
      drop(tasks);

      let sources: Vec<Arc<Source>> =
        self.shared.sources.lock().values().filter_map(Weak::upgrade).collect();
      round += sources.iter().map(|source| source.discard_waiters()).sum::<usize>();
      drop(sources);

      if round == 0 {
        break;
      }
      dropped += round;
    }

    if dropped > 0 {
      tracing::debug!(dropped, "discarded pending tasks");
    }
  }

  pub(crate) fn register(&self, source: &Arc<Source>) {
    self.shared.sources.lock().insert(source.token(), Arc::downgrade(source));
  }

  pub(crate) fn deregister(&self, token: u64) {
    self.shared.sources.lock().remove(&token);
  }

  pub(crate) fn next_token(&self) -> u64 {
    self.shared.next_token.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn poller_add(&self, fd: i32, key: u64, interest: Interest) -> io::Result<()> {
    self.shared.poller.add(fd, key, interest)
  }

  pub(crate) fn poller_modify(
    &self,
    fd: i32,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    self.shared.poller.modify(fd, key, interest)
  }

  pub(crate) fn poller_delete(&self, fd: i32) -> io::Result<()> {
    self.shared.poller.delete(fd)
  }

  pub(crate) fn resolver(&self) -> io::Result<Sender<resolve::Job>> {
    let mut slot = self.shared.resolver.lock();
    if let Some(tx) = slot.as_ref() {
      return Ok(tx.clone());
    }
    let tx = resolve::spawn_resolver()?;
    *slot = Some(tx.clone());
    Ok(tx)
  }
}

pub(crate) fn run_guarded<F: FnOnce()>(f: F) {
  if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
    let msg = payload
      .downcast_ref::<&str>()
      .copied()
      .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
      .unwrap_or("<non-string panic>");
    tracing::error!(panic = msg, "callback panicked on the event loop");
  }
}
