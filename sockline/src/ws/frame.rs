//! WebSocket frame encoding and incremental decoding.
//!
//! Payload lengths use the 7-bit, 16-bit and 64-bit forms. Frames sent by a
//! client are masked with a random key; frames sent by a server are not.
//! Ping and pong frames are consumed without surfacing them, and a close
//! frame ends the stream.

use std::io;

use bytes::{Buf, BytesMut};

/// Which end of the connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
  Server,
  Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpCode {
  Continuation = 0x0,
  Text = 0x1,
  Binary = 0x2,
  Close = 0x8,
  Ping = 0x9,
  Pong = 0xA,
}

impl OpCode {
  fn from_u8(bits: u8) -> Option<Self> {
    Some(match bits {
      0x0 => Self::Continuation,
      0x1 => Self::Text,
      0x2 => Self::Binary,
      0x8 => Self::Close,
      0x9 => Self::Ping,
      0xA => Self::Pong,
      _ => return None,
    })
  }

  fn is_control(self) -> bool {
    (self as u8) & 0x8 != 0
  }
}

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;
/// Control frame payloads are capped at 125 bytes.
const MAX_CONTROL_PAYLOAD: usize = 125;

fn protocol_error(msg: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, format!("websocket: {msg}"))
}

/// Encodes one final frame, masking it when sent from the client side.
pub(crate) fn encode(opcode: OpCode, payload: &[u8], from: Role) -> Vec<u8> {
  let mut out = Vec::with_capacity(payload.len() + 14);
  out.push(0x80 | opcode as u8);

  let mask_bit = if from == Role::Client { 0x80 } else { 0 };
  let len = payload.len();
  if len < 126 {
    out.push(mask_bit | len as u8);
  } else if len <= u16::MAX as usize {
    out.push(mask_bit | 126);
    out.extend_from_slice(&(len as u16).to_be_bytes());
  } else {
    out.push(mask_bit | 127);
    out.extend_from_slice(&(len as u64).to_be_bytes());
  }

  match from {
    Role::Client => {
      let key = fastrand::u32(..).to_be_bytes();
      out.extend_from_slice(&key);
      out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    }
    Role::Server => out.extend_from_slice(payload),
  }
  out
}

/// Close frame with the normal status code and a textual reason.
pub(crate) fn encode_close(from: Role, reason: &str) -> Vec<u8> {
  let mut payload = CLOSE_NORMAL.to_be_bytes().to_vec();
  let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
  while !reason.is_char_boundary(end) {
    end -= 1;
  }
  payload.extend_from_slice(&reason.as_bytes()[..end]);
  encode(OpCode::Close, &payload, from)
}

/// A complete application message or the end of the stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Message {
  Data(Vec<u8>),
  Close,
}

/// Reassembles messages from bytes read off the socket.
pub(crate) struct FrameDecoder {
  buf: BytesMut,
  /// Our side; peers of a server must mask, peers of a client must not.
  local: Role,
  max_payload: usize,
  fragments: Option<Vec<u8>>,
}

impl FrameDecoder {
  pub fn new(local: Role, max_payload: usize) -> Self {
    Self { buf: BytesMut::new(), local, max_payload, fragments: None }
  }

  pub fn extend(&mut self, data: &[u8]) {
    self.buf.extend_from_slice(data);
  }

  /// Returns the next complete message, or `None` if more bytes are needed.
  pub fn next_message(&mut self) -> io::Result<Option<Message>> {
    loop {
      if self.buf.len() < 2 {
        return Ok(None);
      }

      let (b0, b1) = (self.buf[0], self.buf[1]);
      let fin = b0 & 0x80 != 0;
      if b0 & 0x70 != 0 {
        return Err(protocol_error("reserved bits set"));
      }
      let opcode = OpCode::from_u8(b0 & 0x0F)
        .ok_or_else(|| protocol_error("unknown opcode"))?;

      let masked = b1 & 0x80 != 0;
      if masked != (self.local == Role::Server) {
        return Err(protocol_error("unexpected frame masking"));
      }

      let (len, header) = match b1 & 0x7F {
        126 => {
          if self.buf.len() < 4 {
            return Ok(None);
          }
          (u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64, 4)
        }
        127 => {
          if self.buf.len() < 10 {
            return Ok(None);
          }
          let mut raw = [0u8; 8];
          raw.copy_from_slice(&self.buf[2..10]);
          (u64::from_be_bytes(raw), 10)
        }
        n => (n as u64, 2),
      };

      if opcode.is_control() && (len > MAX_CONTROL_PAYLOAD as u64 || !fin) {
        return Err(protocol_error("malformed control frame"));
      }
      if len > self.max_payload as u64 {
        return Err(protocol_error("frame exceeds maximum buffer length"));
      }

      let mask_len = if masked { 4 } else { 0 };
      let total = header + mask_len + len as usize;
      if self.buf.len() < total {
        return Ok(None);
      }

      let mut frame = self.buf.split_to(total);
      let mask = masked.then(|| {
        [frame[header], frame[header + 1], frame[header + 2], frame[header + 3]]
      });
      frame.advance(header + mask_len);
      if let Some(key) = mask {
        for (i, byte) in frame.iter_mut().enumerate() {
          *byte ^= key[i % 4];
        }
      }

      match opcode {
        OpCode::Close => return Ok(Some(Message::Close)),
        OpCode::Ping | OpCode::Pong => continue,
        OpCode::Text | OpCode::Binary => {
          if self.fragments.is_some() {
            return Err(protocol_error("new message inside fragmented message"));
          }
          if fin {
            return Ok(Some(Message::Data(frame.to_vec())));
          }
          self.fragments = Some(frame.to_vec());
        }
        OpCode::Continuation => {
          let Some(acc) = self.fragments.as_mut() else {
            return Err(protocol_error("continuation without a message"));
          };
          acc.extend_from_slice(&frame);
          if acc.len() > self.max_payload {
            return Err(protocol_error("message exceeds maximum buffer length"));
          }
          if fin {
            return Ok(self.fragments.take().map(Message::Data));
          }
        }
      }
    }
  }
}
