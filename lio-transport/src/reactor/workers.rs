use std::{io, thread};

use super::Handle;

/// A pool of OS threads driving one event loop.
pub struct Workers {
  threads: Vec<thread::JoinHandle<()>>,
}

impl Workers {
  /// Spawns `count` threads, each calling [`Handle::run`] until the loop is
  /// stopped.
  ///
  /// If spawning fails part way, the loop is stopped and the threads already
  /// started are joined before the error is returned.
  pub fn spawn(handle: Handle, count: usize) -> io::Result<Self> {
    let mut threads = Vec::with_capacity(count);

    for index in 0..count {
      let worker = handle.clone();
      let spawned = thread::Builder::new()
        .name(format!("lio-transport-worker-{index}"))
        .spawn(move || {
          tracing::debug!(index, "worker started");
          worker.run();
          tracing::debug!(index, "worker exited");
        });

      match spawned {
        Ok(thread) => threads.push(thread),
        Err(err) => {
          handle.stop();
          Self { threads }.join();
          return Err(err);
        }
      }
    }

    Ok(Self { threads })
  }

  pub fn len(&self) -> usize {
    self.threads.len()
  }

  pub fn is_empty(&self) -> bool {
    self.threads.is_empty()
  }

  /// Waits for every worker to leave the loop. Stop the loop first.
  pub fn join(self) {
    for thread in self.threads {
      if thread.join().is_err() {
        tracing::error!("worker thread panicked");
      }
    }
  }
}

impl std::fmt::Debug for Workers {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workers").field("threads", &self.threads.len()).finish()
  }
}
