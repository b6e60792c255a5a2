//! WebSocket over the TCP transports.
//!
//! [`WebSocketServer`] and [`WebSocketClient`] are the TCP server and client
//! with the upgrade handshake and binary framing switched on. Everything else,
//! including callbacks and handles, works exactly as for plain TCP.

pub(crate) mod frame;
pub(crate) mod handshake;

use std::ops::Deref;

use crate::config::SocketConfig;
use crate::tcp::{TcpClient, TcpServer};
use crate::Result;

use frame::{OpCode, Role};

/// Encodes `payload` as one binary frame. Returns the frame and the length of
/// its header.
pub(crate) fn binary_frame(payload: &[u8], from: Role) -> (Vec<u8>, usize) {
  let frame = frame::encode(OpCode::Binary, payload, from);
  let header = frame.len() - payload.len();
  (frame, header)
}

/// A [`TcpServer`] that speaks WebSocket to every peer.
pub struct WebSocketServer {
  inner: TcpServer,
}

impl WebSocketServer {
  pub fn new() -> Result<Self> {
    Self::with_config(SocketConfig::default())
  }

  pub fn with_config(config: SocketConfig) -> Result<Self> {
    Ok(Self { inner: TcpServer::with_config(config)? })
  }

  /// Starts accepting upgrade requests on `port`. Peers that fail the
  /// handshake get `400 Bad Request` and never reach the connect callback.
  pub fn start(&self, port: u16, ipv6: bool) -> Result<bool> {
    self.inner.start_with(port, ipv6, true)
  }
}

impl Deref for WebSocketServer {
  type Target = TcpServer;

  fn deref(&self) -> &TcpServer {
    &self.inner
  }
}

/// A [`TcpClient`] that performs the upgrade handshake on connect and frames
/// every send.
pub struct WebSocketClient {
  inner: TcpClient,
}

impl WebSocketClient {
  pub fn new() -> Result<Self> {
    Self::with_config(SocketConfig::default())
  }

  pub fn with_config(config: SocketConfig) -> Result<Self> {
    Ok(Self { inner: TcpClient::with_mode(config, true)? })
  }
}

impl Deref for WebSocketClient {
  type Target = TcpClient;

  fn deref(&self) -> &TcpClient {
    &self.inner
  }
}
