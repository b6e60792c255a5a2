//! TCP server and client.

mod client;
mod server;

pub use client::TcpClient;
pub use server::TcpServer;

use std::io::{self, Read};

use crate::io::is_connection_lost;
use crate::ws::frame::{FrameDecoder, Message};

/// What one readable event produced.
enum ReadStep {
  Idle,
  /// Raw bytes now in the first `n` bytes of the read buffer.
  Raw(usize),
  Messages { messages: Vec<Vec<u8>>, closed: bool },
  /// End of stream, reset, abort or a broken WebSocket stream.
  Lost(io::Error),
  /// Anything else; the read loop keeps going.
  Failed(io::Error),
}

/// Performs one read and, for WebSocket connections, decodes every complete
/// message it finished. Decoding also runs when the read would block, so
/// bytes buffered before the read are not left waiting.
fn read_step<R: ?Sized>(
  source: &R,
  buf: &mut [u8],
  framing: Option<&mut FrameDecoder>,
) -> ReadStep
where
  for<'a> &'a R: Read,
{
  let mut reader = source;
  let Some(decoder) = framing else {
    return match reader.read(buf) {
      Ok(0) => ReadStep::Lost(io::ErrorKind::UnexpectedEof.into()),
      Ok(n) => ReadStep::Raw(n),
      Err(err) => classify(err),
    };
  };

  match reader.read(buf) {
    Ok(0) => return ReadStep::Lost(io::ErrorKind::UnexpectedEof.into()),
    Ok(n) => {
      decoder.extend(&buf[..n]);
      buf[..n].fill(0);
    }
    Err(err) => match classify(err) {
      ReadStep::Idle => {}
      other => return other,
    },
  }

  let mut messages = Vec::new();
  loop {
    match decoder.next_message() {
      Ok(Some(Message::Data(data))) => messages.push(data),
      Ok(Some(Message::Close)) => return ReadStep::Messages { messages, closed: true },
      Ok(None) => break,
      Err(err) => return ReadStep::Lost(err),
    }
  }
  if messages.is_empty() {
    ReadStep::Idle
  } else {
    ReadStep::Messages { messages, closed: false }
  }
}

fn classify(err: io::Error) -> ReadStep {
  match err.kind() {
    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ReadStep::Idle,
    _ if is_connection_lost(&err) => ReadStep::Lost(err),
    _ => ReadStep::Failed(err),
  }
}

/// Read side of one open connection.
pub(crate) struct Reader {
  buf: Vec<u8>,
  framing: Option<FrameDecoder>,
  failures: u32,
  max_failures: u32,
}

impl Reader {
  pub fn new(max_buffer_len: usize, max_failures: u32, framing: Option<FrameDecoder>) -> Self {
    Self { buf: vec![0; max_buffer_len], framing, failures: 0, max_failures }
  }

  pub fn is_websocket(&self) -> bool {
    self.framing.is_some()
  }

  /// Reads once and hands every payload to `deliver`.
  ///
  /// A failure that does not end the connection goes to `report` and reading
  /// carries on. More than `max_failures` of them in a row, with no data in
  /// between, count as a lost connection. Returns the reason once the
  /// connection is lost.
  pub fn pump<R: ?Sized>(
    &mut self,
    source: &R,
    mut deliver: impl FnMut(&[u8]),
    report: impl FnOnce(io::Error),
  ) -> Option<io::Error>
  where
    for<'a> &'a R: Read,
  {
    match read_step(source, &mut self.buf, self.framing.as_mut()) {
      ReadStep::Idle => None,
      ReadStep::Raw(n) => {
        self.failures = 0;
        deliver(&self.buf[..n]);
        self.buf[..n].fill(0);
        None
      }
      ReadStep::Messages { messages, closed } => {
        self.failures = 0;
        for message in &messages {
          deliver(message);
        }
        closed.then(|| io::Error::new(io::ErrorKind::ConnectionAborted, "websocket closed by peer"))
      }
      ReadStep::Lost(err) => Some(err),
      ReadStep::Failed(err) => {
        tracing::debug!(%err, failures = self.failures + 1, "receive failed");
        report(err);
        self.failures += 1;
        (self.failures > self.max_failures)
          .then(|| io::Error::other("too many consecutive receive errors"))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;
  use std::collections::VecDeque;
  use std::io::Write;
  use std::net::{Shutdown, TcpListener, TcpStream};
  use std::os::fd::AsRawFd;
  use std::time::Duration;

  use crate::io::wait_ready;
  use crate::ws::frame::{self, OpCode, Role};

  fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
  }

  /// Hands out queued read results, then would block.
  struct Scripted(RefCell<VecDeque<io::Result<Vec<u8>>>>);

  impl Scripted {
    fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
      Self(RefCell::new(steps.into()))
    }
  }

  impl Read for &Scripted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      match self.0.borrow_mut().pop_front() {
        Some(Ok(data)) => {
          buf[..data.len()].copy_from_slice(&data);
          Ok(data.len())
        }
        Some(Err(err)) => Err(err),
        None => Err(io::ErrorKind::WouldBlock.into()),
      }
    }
  }

  fn timed_out() -> io::Result<Vec<u8>> {
    Err(io::Error::new(io::ErrorKind::TimedOut, "slow link"))
  }

  #[test]
  fn raw_read_then_eof() {
    let (mut client, server) = pair();
    let mut buf = [0u8; 16];
    assert!(matches!(read_step(&server, &mut buf, None), ReadStep::Idle));

    client.write_all(b"abc").unwrap();
    wait_ready(server.as_raw_fd(), false, Some(Duration::from_secs(5))).unwrap();
    assert!(matches!(read_step(&server, &mut buf, None), ReadStep::Raw(3)));
    assert_eq!(&buf[..3], b"abc");

    client.shutdown(Shutdown::Write).unwrap();
    wait_ready(server.as_raw_fd(), false, Some(Duration::from_secs(5))).unwrap();
    match read_step(&server, &mut buf, None) {
      ReadStep::Lost(err) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
      _ => panic!("expected end of stream"),
    }
  }

  #[test]
  fn buffered_frames_decode_without_new_bytes() {
    let (_client, server) = pair();
    let mut decoder = FrameDecoder::new(Role::Server, 1024);
    decoder.extend(&frame::encode(OpCode::Binary, b"early", Role::Client));

    let mut buf = [0u8; 16];
    match read_step(&server, &mut buf, Some(&mut decoder)) {
      ReadStep::Messages { messages, closed } => {
        assert_eq!(messages, vec![b"early".to_vec()]);
        assert!(!closed);
      }
      _ => panic!("expected a decoded message"),
    }
  }

  #[test]
  fn classification() {
    assert!(matches!(classify(io::ErrorKind::WouldBlock.into()), ReadStep::Idle));
    assert!(matches!(classify(io::ErrorKind::ConnectionReset.into()), ReadStep::Lost(_)));
    assert!(matches!(classify(io::ErrorKind::TimedOut.into()), ReadStep::Failed(_)));
  }

  #[test]
  fn failed_read_is_reported_and_reading_continues() {
    let source = Scripted::new(vec![timed_out(), Ok(b"ab".to_vec()), Ok(b"cd".to_vec())]);
    let mut reader = Reader::new(16, 2, None);
    let mut got = Vec::new();
    let mut reported = Vec::new();

    for _ in 0..3 {
      let lost = reader.pump(&source, |data| got.push(data.to_vec()), |err| reported.push(err.kind()));
      assert!(lost.is_none());
    }
    assert_eq!(reported, vec![io::ErrorKind::TimedOut]);
    assert_eq!(got, vec![b"ab".to_vec(), b"cd".to_vec()]);
  }

  #[test]
  fn consecutive_failures_end_the_connection() {
    let source = Scripted::new(vec![
      timed_out(),
      timed_out(),
      Ok(b"x".to_vec()),
      timed_out(),
      timed_out(),
      timed_out(),
    ]);
    let mut reader = Reader::new(16, 2, None);
    let mut reports = 0;

    let outcomes: Vec<bool> = (0..6)
      .map(|_| reader.pump(&source, |_| {}, |_| reports += 1).is_some())
      .collect();
    assert_eq!(outcomes, vec![false, false, false, false, false, true]);
    assert_eq!(reports, 5);
  }

  #[test]
  fn close_frame_ends_after_delivering_messages() {
    let mut bytes = frame::encode(OpCode::Binary, b"hi", Role::Client);
    bytes.extend(frame::encode_close(Role::Client, "bye"));
    let source = Scripted::new(vec![Ok(bytes)]);
    let mut reader = Reader::new(64, 2, Some(FrameDecoder::new(Role::Server, 64)));
    assert!(reader.is_websocket());

    let mut got = Vec::new();
    let lost = reader.pump(&source, |data| got.push(data.to_vec()), |err| panic!("{err}"));
    assert_eq!(lost.map(|err| err.kind()), Some(io::ErrorKind::ConnectionAborted));
    assert_eq!(got, vec![b"hi".to_vec()]);
  }
}
