//! Exclusive-access wrapper for state shared between a worker's driver and
//! the dispatcher.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An owned value behind a mutex. Guards must not be held across `.await`.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Guarded<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Lock the value. A poisoned lock is recovered since every mutation
    /// leaves the value consistent.
    pub fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside the critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.acquire())
    }
}
