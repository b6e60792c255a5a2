use std::io;
use std::time::Duration;

use socket2::Socket;

/// Largest payload handed to a getting callback unless configured otherwise.
pub const DEFAULT_MAX_BUFFER_LEN: usize = 65530;

/// Default connection limit, also used as the listen backlog.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Tunables shared by every socket object.
///
/// ```
/// use sockline::SocketConfig;
/// use std::time::Duration;
///
/// let config = SocketConfig::default()
///   .with_max_buffer_len(4096)
///   .with_handshake_timeout(Duration::from_secs(2));
/// assert_eq!(config.max_buffer_len, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
  /// Receive buffer length; one read never delivers more than this.
  pub max_buffer_len: usize,
  /// Admission limit for servers. Also the listen backlog.
  pub max_connections: usize,
  /// How often the error pipeline checks its queue.
  pub error_poll_interval: Duration,
  /// Upper bound for a WebSocket handshake. Servers drop peers that have not
  /// finished their upgrade request by then.
  pub handshake_timeout: Duration,
  /// `SO_SNDBUF` for new sockets. `None` keeps the OS default.
  pub send_buffer_size: Option<usize>,
  /// `SO_RCVBUF` for new sockets. `None` keeps the OS default.
  pub recv_buffer_size: Option<usize>,
  /// Consecutive non-fatal read errors tolerated before the connection is
  /// treated as lost.
  pub max_transient_errors: u32,
  /// `TCP_NODELAY` for stream sockets.
  pub nodelay: bool,
}

impl Default for SocketConfig {
  fn default() -> Self {
    Self {
      max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
      max_connections: DEFAULT_MAX_CONNECTIONS,
      error_poll_interval: Duration::from_millis(1),
      handshake_timeout: Duration::from_secs(10),
      send_buffer_size: None,
      recv_buffer_size: None,
      max_transient_errors: 16,
      nodelay: false,
    }
  }
}

impl SocketConfig {
  pub fn with_max_buffer_len(mut self, len: usize) -> Self {
    self.max_buffer_len = len;
    self
  }

  pub fn with_max_connections(mut self, max: usize) -> Self {
    self.max_connections = max;
    self
  }

  pub fn with_error_poll_interval(mut self, interval: Duration) -> Self {
    self.error_poll_interval = interval;
    self
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  pub fn with_send_buffer_size(mut self, size: usize) -> Self {
    self.send_buffer_size = Some(size);
    self
  }

  pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
    self.recv_buffer_size = Some(size);
    self
  }

  pub fn with_max_transient_errors(mut self, max: u32) -> Self {
    self.max_transient_errors = max;
    self
  }

  pub fn with_nodelay(mut self, nodelay: bool) -> Self {
    self.nodelay = nodelay;
    self
  }

  /// Applies the buffer size options to any socket.
  pub(crate) fn apply_buffer_sizes(&self, socket: &Socket) -> io::Result<()> {
    if let Some(size) = self.send_buffer_size {
      socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = self.recv_buffer_size {
      socket.set_recv_buffer_size(size)?;
    }
    Ok(())
  }

  /// Applies buffer sizes and `TCP_NODELAY` to a stream socket.
  pub(crate) fn apply_stream(&self, socket: &Socket) -> io::Result<()> {
    self.apply_buffer_sizes(socket)?;
    socket.set_nodelay(self.nodelay)
  }
}
