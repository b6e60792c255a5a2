//! Blocking helpers over non-blocking sockets.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Something an async or blocking send can write into.
pub(crate) trait WriteSink: AsRawFd {
  /// One non-blocking write attempt. `target` is the datagram destination and
  /// is ignored by streams.
  fn write_to(&self, buf: &[u8], target: Option<SocketAddr>) -> io::Result<usize>;
}

impl WriteSink for TcpStream {
  fn write_to(&self, buf: &[u8], _target: Option<SocketAddr>) -> io::Result<usize> {
    let mut stream = self;
    stream.write(buf)
  }
}

impl WriteSink for UdpSocket {
  fn write_to(&self, buf: &[u8], target: Option<SocketAddr>) -> io::Result<usize> {
    match target {
      Some(target) => self.send_to(buf, target),
      None => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "datagram without destination",
      )),
    }
  }
}

/// Blocks until `fd` is readable (or writable). Returns false on timeout.
pub(crate) fn wait_ready(
  fd: RawFd,
  writable: bool,
  timeout: Option<Duration>,
) -> io::Result<bool> {
  let events = if writable { libc::POLLOUT } else { libc::POLLIN };
  let mut pfd = libc::pollfd { fd, events, revents: 0 };
  let timeout_ms =
    timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as i32);

  loop {
    match syscall!(poll(&mut pfd, 1, timeout_ms)) {
      Ok(n) => return Ok(n > 0),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Err(err),
    }
  }
}

/// Writes all of `buf`, waiting for writability whenever the socket is full.
/// Gives up with `TimedOut` once `deadline` passes.
pub(crate) fn write_all_blocking<S: WriteSink + ?Sized>(
  sink: &S,
  buf: &[u8],
  target: Option<SocketAddr>,
  deadline: Option<Instant>,
) -> io::Result<usize> {
  let mut written = 0;
  while written < buf.len() {
    match sink.write_to(&buf[written..], target) {
      Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
      Ok(n) => written += n,
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if left.is_some_and(|left| left.is_zero())
          || !wait_ready(sink.as_raw_fd(), true, left)?
        {
          return Err(io::ErrorKind::TimedOut.into());
        }
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => return Err(err),
    }
  }
  Ok(written)
}

/// Reads into `buf`, waiting for data until `deadline`.
pub(crate) fn read_with_deadline(
  stream: &TcpStream,
  buf: &mut [u8],
  deadline: Instant,
) -> io::Result<usize> {
  use std::io::Read;

  let mut stream = stream;
  loop {
    match stream.read(buf) {
      Ok(n) => return Ok(n),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() || !wait_ready(stream.as_raw_fd(), false, Some(left))? {
          return Err(io::ErrorKind::TimedOut.into());
        }
      }
      Err(err) => return Err(err),
    }
  }
}

/// Errors that end a connection's read loop. Anything else is retried.
pub(crate) fn is_connection_lost(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::UnexpectedEof
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
  )
}
