#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Sockline - callback-driven sockets
//!
//! Sockline wraps TCP servers and clients, UDP endpoints and WebSocket over
//! TCP behind a small callback API, together with an address type that covers
//! IPv4 and IPv6.
//!
//! ## Features
//! - **One event loop per socket object.** Reads, accepts and async writes
//!   run on a background thread driven by epoll or kqueue.
//! - **Sync or async sends.** Async sends return at once and report progress
//!   through the sending callback, which decides whether a partial write is
//!   retried.
//! - **Decoupled error reporting.** Errors go to a per-object error thread so
//!   I/O never waits on user error handling.
//!
//! ## Platform support
//!
//! | Platform   | Readiness mechanism | Status        |
//! |------------|---------------------|---------------|
//! | Linux      | epoll               | Yes           |
//! | macOS/BSD  | kqueue              | Yes           |
//! | Windows    | -                   | Not supported |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use sockline::{IpAddress, TcpClient, TcpServer};
//!
//! # fn main() -> sockline::Result<()> {
//! let server = TcpServer::new()?;
//! server.set_getting_callback(|handle, data| {
//!   println!("connection {handle} sent {data:?}");
//! });
//! server.start(0, false)?;
//! let port = server.local_port().unwrap_or_default();
//!
//! let client = TcpClient::new()?;
//! client.set_server_addr(IpAddress::localhost(false))?;
//! client.set_server_port(port)?;
//! client.connect_server(0, false, |connected| connected)?;
//! client.send(b"hello", true)?;
//!
//! client.disconnect_server(Duration::from_secs(1))?;
//! server.stop(Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Fallible operations return [`Result`]. `Ok(false)` (or `Ok(0)` for sends)
//! means the operation failed and the error went to the error callback;
//! `Err` means no error callback was registered, so the error is handed back
//! directly. Errors raised on the event loop with no callback registered are
//! logged through `tracing`.

#[macro_use]
mod macros;

mod addr;
mod base;
mod callback;
mod config;
mod connection;
mod error;
mod io;
mod poll;
mod reactor;
mod report;
mod send;
mod sync;
mod tcp;
mod udp;
mod ws;

pub use addr::{AddrParseError, IpAddress, Ipv4, Ipv6, local_ipv4_addr, local_ipv6_addr};
pub use callback::{
  ClientConnectCallback, ClientGettingCallback, ClientLostCallback, ErrorCallback, Handle,
  SendProgress, SendingCallback, ServerConnectCallback, ServerGettingCallback,
  ServerLostCallback, UdpGettingCallback,
};
pub use config::{DEFAULT_MAX_BUFFER_LEN, DEFAULT_MAX_CONNECTIONS, SocketConfig};
pub use connection::ConnectionInfo;
pub use error::{ErrorKind, Result, SocketError};
pub use tcp::{TcpClient, TcpServer};
pub use udp::UdpEndpoint;
pub use ws::{WebSocketClient, WebSocketServer};
