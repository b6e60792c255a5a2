use std::{fmt, io};

use crate::addr::AddrParseError;

/// Category of a [`SocketError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// The object is in the wrong state for the request: already listening,
  /// not connected, too many connections, a shutdown that timed out.
  SocketState,
  /// The operating system or the transport reported a failure.
  System,
  /// A caller-supplied value is unusable.
  InvalidArgument,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::SocketState => "socket state error",
      Self::System => "system error",
      Self::InvalidArgument => "invalid argument",
    })
  }
}

/// Error value carried through the error pipeline and returned from the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketError {
  kind: ErrorKind,
  message: String,
  code: i32,
}

impl SocketError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self { kind, message: message.into(), code: 0 }
  }

  pub fn with_code(kind: ErrorKind, message: impl Into<String>, code: i32) -> Self {
    Self { kind, message: message.into(), code }
  }

  pub fn state(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::SocketState, message)
  }

  pub fn invalid_argument(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidArgument, message)
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  /// Raw OS error number for [`ErrorKind::System`] errors, otherwise 0.
  pub fn code(&self) -> i32 {
    self.code
  }
}

impl std::error::Error for SocketError {}

impl fmt::Display for SocketError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)?;
    if self.code != 0 {
      write!(f, " (os error {})", self.code)?;
    }
    Ok(())
  }
}

impl From<io::Error> for SocketError {
  fn from(err: io::Error) -> Self {
    Self::with_code(ErrorKind::System, err.to_string(), err.raw_os_error().unwrap_or(0))
  }
}

impl From<AddrParseError> for SocketError {
  fn from(err: AddrParseError) -> Self {
    Self::invalid_argument(err.to_string())
  }
}

pub type Result<T, E = SocketError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_keep_os_code() {
    let err = SocketError::from(io::Error::from_raw_os_error(libc::ECONNRESET));
    assert_eq!(err.kind(), ErrorKind::System);
    assert_eq!(err.code(), libc::ECONNRESET);
    assert!(err.to_string().starts_with("system error: "));
  }

  #[test]
  fn synthetic_io_errors_have_zero_code() {
    let err = SocketError::from(io::Error::new(io::ErrorKind::InvalidData, "bad frame"));
    assert_eq!(err.code(), 0);
    assert_eq!(err.to_string(), "system error: bad frame");
  }

  #[test]
  fn parse_errors_are_invalid_arguments() {
    let err = SocketError::from(AddrParseError::Format { expected_fields: 4 });
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }
}
