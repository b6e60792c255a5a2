//! HTTP/1.1 upgrade handshake.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::IpAddress;
use crate::io::{read_with_deadline, write_all_blocking};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Upper bound for a request or response head.
pub(crate) const MAX_HEAD_LEN: usize = 8192;

pub(crate) const REJECTION: &[u8] =
  b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

fn handshake_error(msg: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, format!("websocket handshake: {msg}"))
}

/// `base64(SHA1(key + GUID))`.
pub(crate) fn accept_key(key: &str) -> String {
  let mut sha = Sha1::new();
  sha.update(key.as_bytes());
  sha.update(WS_GUID.as_bytes());
  STANDARD.encode(sha.finalize())
}

fn generate_key() -> String {
  let nonce: [u8; 16] = std::array::from_fn(|_| fastrand::u8(..));
  STANDARD.encode(nonce)
}

/// Returns the length of the HTTP head if `buf` contains a complete one.
pub(crate) fn head_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

struct Head<'a> {
  start_line: &'a str,
  headers: Vec<(&'a str, &'a str)>,
}

impl<'a> Head<'a> {
  fn parse(raw: &'a [u8]) -> io::Result<Self> {
    let text =
      std::str::from_utf8(raw).map_err(|_| handshake_error("head is not utf-8"))?;
    let mut lines = text.split("\r\n").filter(|line| !line.is_empty());
    let start_line = lines.next().ok_or_else(|| handshake_error("empty head"))?;

    let mut headers = Vec::new();
    for line in lines {
      let (name, value) = line
        .split_once(':')
        .ok_or_else(|| handshake_error("malformed header line"))?;
      headers.push((name.trim(), value.trim()));
    }
    Ok(Self { start_line, headers })
  }

  fn header(&self, name: &str) -> Option<&'a str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| *value)
  }

  fn header_has_token(&self, name: &str, token: &str) -> bool {
    self.header(name).is_some_and(|value| {
      value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
    })
  }
}

/// Validates an upgrade request and returns the `Sec-WebSocket-Accept` value.
pub(crate) fn parse_request(raw: &[u8]) -> io::Result<String> {
  let head = Head::parse(raw)?;

  let mut parts = head.start_line.split_whitespace();
  if parts.next() != Some("GET") || parts.nth(1) != Some("HTTP/1.1") {
    return Err(handshake_error("expected a GET HTTP/1.1 request"));
  }
  if !head.header_has_token("Upgrade", "websocket") {
    return Err(handshake_error("missing Upgrade: websocket"));
  }
  if !head.header_has_token("Connection", "upgrade") {
    return Err(handshake_error("missing Connection: Upgrade"));
  }
  if head.header("Sec-WebSocket-Version") != Some("13") {
    return Err(handshake_error("unsupported websocket version"));
  }
  let key = head
    .header("Sec-WebSocket-Key")
    .filter(|key| !key.is_empty())
    .ok_or_else(|| handshake_error("missing Sec-WebSocket-Key"))?;

  Ok(accept_key(key))
}

pub(crate) fn response(accept: &str) -> String {
  format!(
    "HTTP/1.1 101 Switching Protocols\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Accept: {accept}\r\n\r\n"
  )
}

/// `host:port` as HTTP writes it, with IPv6 hosts in standard notation.
fn authority(host: &IpAddress, port: u16) -> String {
  SocketAddr::new(host.to_std(), port).to_string()
}

fn request(host: &IpAddress, port: u16, key: &str) -> String {
  let authority = authority(host, port);
  format!(
    "GET / HTTP/1.1\r\n\
     Host: {authority}\r\n\
     Origin: ws://{authority}\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Key: {key}\r\n\
     Sec-WebSocket-Version: 13\r\n\r\n"
  )
}

fn verify_response(raw: &[u8], key: &str) -> io::Result<()> {
  let head = Head::parse(raw)?;
  let mut parts = head.start_line.split_whitespace();
  if parts.next() != Some("HTTP/1.1") || parts.next() != Some("101") {
    return Err(handshake_error("server refused the upgrade"));
  }
  if head.header("Sec-WebSocket-Accept") != Some(accept_key(key).as_str()) {
    return Err(handshake_error("wrong Sec-WebSocket-Accept"));
  }
  Ok(())
}

/// Runs the client side of the handshake on a non-blocking stream. Returns
/// bytes the server sent after its response head.
pub(crate) fn client_handshake(
  stream: &TcpStream,
  host: &IpAddress,
  port: u16,
  timeout: Duration,
) -> io::Result<Vec<u8>> {
  let deadline = Instant::now() + timeout;
  let key = generate_key();
  tracing::debug!(url = %format!("ws://{}", authority(host, port)), "websocket handshake");
  write_all_blocking(stream, request(host, port, &key).as_bytes(), None, Some(deadline))?;

  let mut buf = Vec::with_capacity(512);
  let mut chunk = [0u8; 512];
  loop {
    let n = read_with_deadline(stream, &mut chunk, deadline)?;
    if n == 0 {
      return Err(io::ErrorKind::UnexpectedEof.into());
    }
    buf.extend_from_slice(&chunk[..n]);

    if let Some(end) = head_end(&buf) {
      verify_response(&buf[..end], &key)?;
      return Ok(buf.split_off(end));
    }
    if buf.len() > MAX_HEAD_LEN {
      return Err(handshake_error("response head too large"));
    }
  }
}
