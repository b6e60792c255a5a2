use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::callback::{ErrorCallback, SendingCallback};
use crate::config::SocketConfig;
use crate::report::ErrorPipeline;
use crate::sync::Mutex;
use crate::{IpAddress, Result, SocketError};

/// State every socket object carries: configuration, the sending callback and
/// the error pipeline.
pub(crate) struct SocketBase {
  config: SocketConfig,
  max_buffer_len: AtomicUsize,
  /// Set while listening or connected.
  active: AtomicBool,
  sending: Mutex<Option<SendingCallback>>,
  errors: ErrorPipeline,
}

impl SocketBase {
  pub fn new(config: SocketConfig) -> Self {
    Self {
      max_buffer_len: AtomicUsize::new(config.max_buffer_len),
      active: AtomicBool::new(false),
      sending: Mutex::new(None),
      errors: ErrorPipeline::start(config.error_poll_interval),
      config,
    }
  }

  pub fn config(&self) -> &SocketConfig {
    &self.config
  }

  pub fn max_buffer_len(&self) -> usize {
    self.max_buffer_len.load(Ordering::Acquire)
  }

  /// Changing the buffer length of a live socket is refused.
  pub fn set_max_buffer_len(&self, len: usize) -> bool {
    if len == 0 || self.is_active() {
      return false;
    }
    self.max_buffer_len.store(len, Ordering::Release);
    true
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }

  pub fn set_active(&self, active: bool) {
    self.active.store(active, Ordering::Release);
  }

  /// Atomically flips inactive to active. Returns false if already active.
  pub fn try_activate(&self) -> bool {
    self
      .active
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub fn set_sending_callback(&self, callback: Option<SendingCallback>) {
    *self.sending.lock() = callback;
  }

  pub fn sending_callback(&self) -> Option<SendingCallback> {
    self.sending.lock().clone()
  }

  pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
    self.errors.set_callback(callback);
  }

  /// Queues an error for the error callback.
  ///
  /// Returns the error itself when no callback is registered, which the
  /// public API surfaces as `Err`.
  pub fn report(
    &self,
    error: SocketError,
    addr: IpAddress,
    port: u16,
    operation: &str,
  ) -> Result<()> {
    self.errors.report(error, addr, port, operation)
  }

  /// Like [`report`](Self::report), for contexts with no caller to hand the
  /// error back to, such as the event loop.
  pub fn report_or_log(
    &self,
    error: SocketError,
    addr: IpAddress,
    port: u16,
    operation: &str,
  ) {
    if let Err(error) = self.report(error, addr, port, operation) {
      tracing::warn!(%error, %addr, port, operation, "unreported socket error");
    }
  }

  /// Reports `error` and yields `Ok(fail)`, or `Err` without a callback.
  pub fn fail<T>(
    &self,
    fail: T,
    error: SocketError,
    addr: IpAddress,
    port: u16,
    operation: &str,
  ) -> Result<T> {
    self.report(error, addr, port, operation).map(|()| fail)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffer_len_locked_while_active() {
    let base = SocketBase::new(SocketConfig::default());
    assert!(base.set_max_buffer_len(1024));
    assert_eq!(base.max_buffer_len(), 1024);

    assert!(base.try_activate());
    assert!(!base.try_activate());
    assert!(!base.set_max_buffer_len(2048));
    assert_eq!(base.max_buffer_len(), 1024);

    base.set_active(false);
    assert!(!base.set_max_buffer_len(0));
  }

  #[test]
  fn fail_without_callback_is_err() {
    let base = SocketBase::new(SocketConfig::default());
    let res = base.fail(0usize, SocketError::state("x"), IpAddress::default(), 0, "t");
    assert!(res.is_err());
  }
}
