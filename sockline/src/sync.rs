//! The one lock type the crate uses: `parking_lot::Mutex` with the
//! `parking_lot` feature, otherwise a thin `std::sync::Mutex` wrapper that
//! ignores poisoning. A callback that panics on an event loop thread must not
//! leave tables and queues unusable for every other thread.

#[cfg(feature = "parking_lot")]
pub use parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
pub use self::unpoisoned::Mutex;

#[cfg(not(feature = "parking_lot"))]
mod unpoisoned {
  use std::sync::{self, PoisonError, TryLockError};

  pub struct Mutex<T: ?Sized>(sync::Mutex<T>);

  impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
      Self(sync::Mutex::new(value))
    }
  }

  impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> sync::MutexGuard<'_, T> {
      self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` only while another thread holds the lock.
    pub fn try_lock(&self) -> Option<sync::MutexGuard<'_, T>> {
      match self.0.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
      }
    }
  }

}
