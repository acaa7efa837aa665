//! Background task handle polled without blocking.
//!
//! The producing side runs on the tokio runtime; the owner only asks
//! whether the task finished and whether it failed. A failure is captured in
//! the handle and handed out once.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::errors::{DomainError, DomainResult};

#[derive(Debug)]
struct Slot<T> {
    finished: AtomicBool,
    outcome: Mutex<Option<DomainResult<T>>>,
}

impl<T> Slot<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DomainResult<T>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to at most one in-flight unit of background work.
#[derive(Debug)]
pub struct AsyncTask<T> {
    slot: Arc<Slot<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T> Default for AsyncTask<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T> AsyncTask<T> {
    /// A handle with nothing in flight; reports finished.
    pub fn idle() -> Self {
        Self {
            slot: Arc::new(Slot {
                finished: AtomicBool::new(true),
                outcome: Mutex::new(None),
            }),
            handle: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.slot.finished.load(Ordering::Acquire)
    }

    /// Whether the task completed with an error not yet taken.
    pub fn is_error(&self) -> bool {
        matches!(*self.slot.lock(), Some(Err(_)))
    }

    /// Completion guard: surfaces a captured error, otherwise reports
    /// whether the task is done.
    pub fn poll(&self) -> DomainResult<bool> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(self.is_finished())
    }

    /// Take the captured error, if any.
    pub fn take_error(&self) -> Option<DomainError> {
        let mut outcome = self.slot.lock();
        if matches!(*outcome, Some(Err(_))) {
            return outcome.take().and_then(Result::err);
        }
        None
    }

    /// Take the produced value once the task has finished successfully.
    pub fn take_output(&self) -> Option<T> {
        let mut outcome = self.slot.lock();
        if matches!(*outcome, Some(Ok(_))) {
            return outcome.take().and_then(Result::ok);
        }
        None
    }

    /// Whether a spawned task may still be running.
    pub fn in_flight(&self) -> bool {
        self.handle.is_some() && !self.is_finished()
    }

    /// Wait up to `grace` for the task to end, aborting it afterwards.
    /// Any captured error is discarded and returned.
    pub async fn settle(&mut self, grace: Duration) -> Option<DomainError> {
        if let Some(handle) = self.handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "background task did not finish, aborting");
                abort.abort();
                self.slot.finished.store(true, Ordering::Release);
            }
        }
        self.take_error()
    }
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Run `future` in the background, capturing its result or panic.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = DomainResult<T>> + Send + 'static,
    {
        let slot = Arc::new(Slot {
            finished: AtomicBool::new(false),
            outcome: Mutex::new(None),
        });
        let sink = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(DomainError::Process(panic_message(panic.as_ref()))));
            *sink.lock() = Some(outcome);
            sink.finished.store(true, Ordering::Release);
        });
        Self {
            slot,
            handle: Some(handle),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("background task panicked: {detail}")
}
