//! Error pipeline.
//!
//! Every failure inside the library is queued here and delivered to the
//! user's error callback from a dedicated thread, so reporting never blocks
//! the thread that hit the error. Records left in the queue when the
//! pipeline shuts down are discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::callback::ErrorCallback;
use crate::sync::Mutex;
use crate::{IpAddress, SocketError};

struct ErrorRecord {
  error: SocketError,
  addr: IpAddress,
  port: u16,
  operation: String,
}

struct Shared {
  running: AtomicBool,
  callback: Mutex<Option<ErrorCallback>>,
}

pub(crate) struct ErrorPipeline {
  shared: Arc<Shared>,
  tx: Sender<ErrorRecord>,
  rx: Receiver<ErrorRecord>,
  thread: Option<JoinHandle<()>>,
}

impl ErrorPipeline {
  /// Starts the delivery thread, which checks the queue every
  /// `poll_interval` while running.
  pub fn start(poll_interval: Duration) -> Self {
    let (tx, rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
      running: AtomicBool::new(true),
      callback: Mutex::new(None),
    });

    let thread = {
      let shared = Arc::clone(&shared);
      let rx = rx.clone();
      thread::Builder::new()
        .name("sockline-errors".into())
        .spawn(move || deliver(&shared, &rx, poll_interval))
        .map_err(|err| {
          tracing::error!(%err, "failed to spawn error pipeline thread");
          err
        })
        .ok()
    };

    if thread.is_none() {
      shared.running.store(false, Ordering::Release);
    }

    Self { shared, tx, rx, thread }
  }

  pub fn set_callback(&self, callback: Option<ErrorCallback>) {
    *self.shared.callback.lock() = callback;
  }

  pub fn has_callback(&self) -> bool {
    self.shared.callback.lock().is_some()
  }

  /// Queues `error` for delivery.
  ///
  /// Hands the error back when there is no callback to deliver it to.
  pub fn report(
    &self,
    error: SocketError,
    addr: IpAddress,
    port: u16,
    operation: &str,
  ) -> Result<(), SocketError> {
    if !self.has_callback() || !self.shared.running.load(Ordering::Acquire) {
      return Err(error);
    }

    tracing::debug!(%error, %addr, port, operation, "queueing error report");
    let record = ErrorRecord { error, addr, port, operation: operation.to_owned() };
    self.tx.send(record).map_err(|err| err.into_inner().error)
  }

  /// Stops the delivery thread and drops whatever is still queued.
  pub fn shutdown(&mut self) {
    self.shared.running.store(false, Ordering::Release);
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }

    let dropped = self.rx.try_iter().count();
    if dropped > 0 {
      tracing::debug!(dropped, "discarded undelivered error reports");
    }
  }
}

impl Drop for ErrorPipeline {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn deliver(shared: &Shared, rx: &Receiver<ErrorRecord>, poll_interval: Duration) {
  while shared.running.load(Ordering::Acquire) {
    let record = match rx.recv_timeout(poll_interval) {
      Ok(record) => record,
      Err(RecvTimeoutError::Timeout) => continue,
      Err(RecvTimeoutError::Disconnected) => break,
    };

    // Clone out so the callback runs without the lock held.
    let callback = shared.callback.lock().clone();
    match callback {
      Some(callback) => {
        callback(&record.error, &record.addr, record.port, &record.operation)
      }
      None => tracing::warn!(
        error = %record.error,
        operation = %record.operation,
        "error callback removed before delivery"
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Instant;

  #[test]
  fn without_callback_hands_error_back() {
    let pipeline = ErrorPipeline::start(Duration::from_millis(1));
    let err = pipeline
      .report(SocketError::state("nope"), IpAddress::default(), 0, "test")
      .unwrap_err();
    assert_eq!(err.message(), "nope");
  }

  #[test]
  fn delivers_on_pipeline_thread() {
    let pipeline = ErrorPipeline::start(Duration::from_millis(1));
    let (tx, rx) = std::sync::mpsc::channel();
    let caller = thread::current().id();
    pipeline.set_callback(Some(Arc::new(
      move |err: &SocketError, _: &IpAddress, port: u16, op: &str| {
        tx.send((err.clone(), port, op.to_owned(), thread::current().id()))
          .unwrap();
      },
    )));

    pipeline
      .report(SocketError::state("boom"), IpAddress::localhost(false), 80, "accept")
      .unwrap();

    let (err, port, op, thread) =
      rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err.message(), "boom");
    assert_eq!(port, 80);
    assert_eq!(op, "accept");
    assert_ne!(thread, caller);
  }

  #[test]
  fn shutdown_discards_queue() {
    let mut pipeline = ErrorPipeline::start(Duration::from_millis(1));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    pipeline.set_callback(Some(Arc::new(
      move |_: &SocketError, _: &IpAddress, _: u16, _: &str| {
        thread::sleep(Duration::from_millis(20));
        counter.fetch_add(1, Ordering::SeqCst);
      },
    )));

    for _ in 0..50 {
      pipeline
        .report(SocketError::state("x"), IpAddress::default(), 0, "t")
        .unwrap();
    }

    let start = Instant::now();
    pipeline.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(delivered.load(Ordering::SeqCst) < 50);

    assert!(
      pipeline
        .report(SocketError::state("late"), IpAddress::default(), 0, "t")
        .is_err()
    );
  }
}
