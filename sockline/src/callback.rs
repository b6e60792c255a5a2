//! Callback signatures.
//!
//! Callbacks are stored as shared trait objects so the event loop can clone
//! them out from under a lock before invoking them. Every setter on the
//! socket objects accepts a plain closure and wraps it.

use std::sync::Arc;

use crate::{IpAddress, SocketError};

/// Connection handle assigned by a server. Handles are reused once freed.
pub type Handle = u32;

/// Progress of one asynchronous send.
#[derive(Debug, Clone, Copy)]
pub struct SendProgress<'a> {
  /// Bytes written by the attempt that just completed. Zero after an error.
  pub sent: usize,
  /// How many times this callback already ran for the same buffer.
  pub retry: u32,
  /// Connection handle for servers, 0 for clients and UDP.
  pub handle: Handle,
  /// The whole buffer passed to `send`.
  pub buffer: &'a [u8],
}

impl SendProgress<'_> {
  pub fn full_len(&self) -> usize {
    self.buffer.len()
  }
}

/// `(error, peer address, peer port, operation)`.
pub type ErrorCallback =
  Arc<dyn Fn(&SocketError, &IpAddress, u16, &str) + Send + Sync>;

/// Return `false` to stop retrying the rest of a partially written buffer.
pub type SendingCallback = Arc<dyn Fn(SendProgress<'_>) -> bool + Send + Sync>;

/// Return `false` to reject the connection.
pub type ServerConnectCallback = Arc<dyn Fn(Handle) -> bool + Send + Sync>;
pub type ServerLostCallback = Arc<dyn Fn(Handle) + Send + Sync>;
pub type ServerGettingCallback = Arc<dyn Fn(Handle, &[u8]) + Send + Sync>;

/// Receives whether the connect succeeded. Returning `false` on success
/// disconnects again.
pub type ClientConnectCallback = Arc<dyn Fn(bool) -> bool + Send + Sync>;
pub type ClientLostCallback = Arc<dyn Fn() + Send + Sync>;
pub type ClientGettingCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// `(sender address, sender port, datagram)`.
pub type UdpGettingCallback =
  Arc<dyn Fn(&IpAddress, u16, &[u8]) + Send + Sync>;
