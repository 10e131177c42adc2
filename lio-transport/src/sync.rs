//! The one lock the transport uses, for source waiters, the source table and
//! the acceptor's slots.
//!
//! Backed by `parking_lot` with the `parking_lot` feature and by `std::sync`
//! otherwise. Callbacks never run with one of these held, so a poisoned std
//! lock is simply taken over.

#[cfg(feature = "parking_lot")]
pub use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
pub use self::poison_free::Mutex;

#[cfg(not(feature = "parking_lot"))]
mod poison_free {
  use std::{ops, sync};

  #[derive(Default)]
  pub struct Mutex<T> {
    inner: sync::Mutex<T>,
  }

  impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
      Self { inner: sync::Mutex::new(value) }
    }

    pub fn lock(&self) -> Guard<'_, T> {
      Guard(self.inner.lock().unwrap_or_else(sync::PoisonError::into_inner))
    }

    pub fn get_mut(&mut self) -> &mut T {
      self.inner.get_mut().unwrap_or_else(sync::PoisonError::into_inner)
    }
  }

  pub struct Guard<'a, T>(sync::MutexGuard<'a, T>);

  impl<T> ops::Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
      &self.0
    }
  }

  impl<T> ops::DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
      &mut self.0
    }
  }
}
