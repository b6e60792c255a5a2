//! TCP client with a single server connection.
//!
//! A synchronous connect blocks the caller and then hands the stream to the
//! event loop. An asynchronous connect registers the half-open stream for
//! writability and finishes on the loop thread, where the same driver then
//! becomes the read loop.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::split_socket_addr;
use crate::base::SocketBase;
use crate::callback::{
  ClientConnectCallback, ClientGettingCallback, ClientLostCallback, ErrorCallback,
  SendProgress,
};
use crate::config::SocketConfig;
use crate::poll::Interest;
use crate::reactor::{EventLoop, Readiness, Token};
use crate::send::{Flush, WriteQueue};
use crate::sync::Mutex;
use crate::ws::frame::{self, FrameDecoder, Role};
use crate::ws::{self, handshake};
use crate::{IpAddress, Result, SocketError};

use super::Reader;

/// Close reason sent to a WebSocket server on disconnect.
const DISCONNECT: &str = "Disconnect";
const DROP_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct ClientCallbacks {
  lost: Option<ClientLostCallback>,
  getting: Option<ClientGettingCallback>,
}

#[derive(Clone, Copy, Default)]
struct Target {
  addr: Option<IpAddress>,
  port: u16,
}

/// The one connection of a client, from connect attempt to disconnect.
struct Connection {
  stream: Arc<TcpStream>,
  writes: Arc<WriteQueue>,
  token: Option<Token>,
  /// Set once the connection is established.
  local: Option<(IpAddress, u16)>,
}

impl Connection {
  fn new(stream: Arc<TcpStream>) -> Self {
    Self {
      stream,
      writes: Arc::new(WriteQueue::new()),
      token: None,
      local: None,
    }
  }
}

struct ClientShared {
  base: SocketBase,
  event_loop: EventLoop,
  websocket: bool,
  target: Mutex<Target>,
  conn: Mutex<Option<Connection>>,
  callbacks: Mutex<ClientCallbacks>,
}

/// A TCP client.
///
/// ```no_run
/// use sockline::{IpAddress, TcpClient};
///
/// let client = TcpClient::new()?;
/// client.set_server_addr(IpAddress::localhost(false))?;
/// client.set_server_port(9000)?;
/// client.set_getting_callback(|data| println!("got {} bytes", data.len()));
/// client.connect_server(0, false, |ok| ok)?;
/// client.send(b"hello", false)?;
/// # Ok::<(), sockline::SocketError>(())
/// ```
pub struct TcpClient {
  shared: Arc<ClientShared>,
}

impl TcpClient {
  pub fn new() -> Result<Self> {
    Self::with_config(SocketConfig::default())
  }

  pub fn with_config(config: SocketConfig) -> Result<Self> {
    Self::with_mode(config, false)
  }

  pub(crate) fn with_mode(config: SocketConfig, websocket: bool) -> Result<Self> {
    Ok(Self {
      shared: Arc::new(ClientShared {
        event_loop: EventLoop::new()?,
        base: SocketBase::new(config),
        websocket,
        target: Mutex::new(Target::default()),
        conn: Mutex::new(None),
        callbacks: Mutex::new(ClientCallbacks::default()),
      }),
    })
  }

  /// Called when the server goes away. Not called after
  /// [`disconnect_server`](Self::disconnect_server).
  ///
  /// More than [`SocketConfig::max_transient_errors`] receive errors in a
  /// row also end the connection and run this callback, although the server
  /// never closed it.
  pub fn set_lost_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
    self.shared.callbacks.lock().lost = Some(Arc::new(callback));
  }

  pub fn set_getting_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
    self.shared.callbacks.lock().getting = Some(Arc::new(callback));
  }

  pub fn set_sending_callback(
    &self,
    callback: impl Fn(SendProgress<'_>) -> bool + Send + Sync + 'static,
  ) {
    self.shared.base.set_sending_callback(Some(Arc::new(callback)));
  }

  pub fn set_error_callback(
    &self,
    callback: impl Fn(&SocketError, &IpAddress, u16, &str) + Send + Sync + 'static,
  ) {
    let callback: ErrorCallback = Arc::new(callback);
    self.shared.base.set_error_callback(Some(callback));
  }

  pub fn max_buffer_len(&self) -> usize {
    self.shared.base.max_buffer_len()
  }

  /// Refused with `false` while connected.
  pub fn set_max_buffer_len(&self, len: usize) -> bool {
    self.shared.base.set_max_buffer_len(len)
  }

  pub fn is_websocket(&self) -> bool {
    self.shared.websocket
  }

  pub fn server_addr(&self) -> Option<IpAddress> {
    self.shared.target.lock().addr
  }

  pub fn server_port(&self) -> u16 {
    self.shared.target.lock().port
  }

  /// Refused with a socket state error while connected.
  pub fn set_server_addr(&self, addr: impl Into<IpAddress>) -> Result<bool> {
    let addr = addr.into();
    if self.shared.base.is_active() {
      let err = SocketError::state("cannot change the server address while connected");
      return self.shared.base.fail(false, err, addr, self.server_port(), "set_server_addr");
    }
    self.shared.target.lock().addr = Some(addr);
    Ok(true)
  }

  /// Port 0 is refused with `Ok(false)`; so is any change while connected,
  /// which also reports a socket state error.
  pub fn set_server_port(&self, port: u16) -> Result<bool> {
    if port == 0 {
      return Ok(false);
    }
    if self.shared.base.is_active() {
      let err = SocketError::state("cannot change the server port while connected");
      let addr = self.server_addr().unwrap_or_default();
      return self.shared.base.fail(false, err, addr, port, "set_server_port");
    }
    self.shared.target.lock().port = port;
    Ok(true)
  }

  pub fn is_connected(&self) -> bool {
    self.shared.conn.lock().as_ref().is_some_and(|conn| conn.local.is_some())
  }

  pub fn local_addr(&self) -> Option<IpAddress> {
    self.shared.conn.lock().as_ref().and_then(|conn| conn.local).map(|(addr, _)| addr)
  }

  pub fn local_port(&self) -> Option<u16> {
    self.shared.conn.lock().as_ref().and_then(|conn| conn.local).map(|(_, port)| port)
  }

  /// Connects to the configured server from `local_port` (0 for an ephemeral
  /// port).
  ///
  /// `on_connect` learns whether the connect succeeded; returning false from
  /// it disconnects again. A synchronous connect returns once the outcome is
  /// known. An asynchronous one returns `Ok(true)` as soon as the attempt is
  /// underway and calls `on_connect` from the event loop.
  pub fn connect_server(
    &self,
    local_port: u16,
    is_async: bool,
    on_connect: impl Fn(bool) -> bool + Send + Sync + 'static,
  ) -> Result<bool> {
    let shared = &self.shared;
    let on_connect: ClientConnectCallback = Arc::new(on_connect);
    let Target { addr, port } = *shared.target.lock();
    let Some(addr) = addr else {
      let err = SocketError::invalid_argument("server address is not set");
      return shared.base.fail(false, err, IpAddress::default(), port, "connect");
    };
    if port == 0 {
      let err = SocketError::invalid_argument("server port is not set");
      return shared.base.fail(false, err, addr, port, "connect");
    }
    if !shared.base.try_activate() {
      let err = SocketError::state("client is already connected");
      return shared.base.fail(false, err, addr, port, "connect");
    }

    let attempt = if is_async {
      shared.connect_async(addr, port, local_port, Arc::clone(&on_connect))
    } else {
      shared.connect_sync(addr, port, local_port)
    };
    if let Err(err) = attempt {
      tracing::debug!(%addr, port, %err, "connect failed");
      shared.release(DROP_WAIT);
      let res = shared.base.fail(false, err.into(), addr, port, "connect");
      on_connect(false);
      return res;
    }
    if is_async {
      return Ok(true);
    }

    tracing::info!(%addr, port, websocket = shared.websocket, "connected");
    if !on_connect(true) {
      tracing::debug!("connect callback declined the connection");
      shared.release(DROP_WAIT);
      return Ok(false);
    }
    Ok(true)
  }

  /// Closes the connection and stops the event loop, waiting at most `wait`
  /// for it. WebSocket servers receive a close frame first. The server
  /// address and port are kept for the next connect.
  pub fn disconnect_server(&self, wait: Duration) -> Result<bool> {
    let shared = &self.shared;
    let (addr, port) = shared.target();
    if shared.conn.lock().is_none() {
      let err = SocketError::state("client is not connected");
      return shared.base.fail(false, err, addr, port, "disconnect");
    }

    if !shared.release(wait) {
      let err = SocketError::state(format!("event loop did not stop within {wait:?}"));
      return shared.base.fail(false, err, addr, port, "disconnect");
    }
    tracing::info!(%addr, port, "disconnected");
    Ok(true)
  }

  /// Sends `data` to the server. Synchronous sends return the byte count;
  /// asynchronous ones return `Ok(0)` and report to the sending callback.
  /// Both kinds go out in the order of the calls.
  pub fn send(&self, data: &[u8], is_async: bool) -> Result<usize> {
    let shared = &self.shared;
    let (addr, port) = shared.target();
    if data.is_empty() {
      let err = SocketError::invalid_argument("send buffer is empty");
      return shared.base.fail(0, err, addr, port, "send");
    }

    let established = shared
      .conn
      .lock()
      .as_ref()
      .filter(|conn| conn.local.is_some())
      .map(|conn| (Arc::clone(&conn.stream), Arc::clone(&conn.writes), conn.token));
    let Some((stream, writes, token)) = established else {
      let err = SocketError::state("client is not connected");
      return shared.base.fail(0, err, addr, port, "send");
    };
    let (buffer, header) = if shared.websocket {
      ws::binary_frame(data, Role::Client)
    } else {
      (data.to_vec(), 0)
    };

    if !is_async {
      let sending = shared.base.sending_callback();
      let res = writes.write_blocking(&*stream, buffer, header, 0, sending.as_ref(), |err, _| {
        shared.base.report_or_log(err.into(), addr, port, "send");
      });
      return match res {
        Ok(n) => Ok(n),
        Err(err) => shared.base.fail(0, err.into(), addr, port, "send"),
      };
    }

    if shared.websocket {
      // Masked on the wire; the sending callback still sees the caller's bytes.
      writes.push_frame(buffer, header, Some(data.to_vec()), 0);
    } else {
      writes.push(buffer, 0, None);
    }
    let client = Arc::downgrade(shared);
    let posted = shared.event_loop.post(move || {
      let Some(client) = client.upgrade() else { return };
      if client.flush_writes(&stream, &writes) == Flush::Blocked
        && let Some(token) = token
      {
        client.event_loop.rearm(token, Interest::ReadWrite);
      }
    });

    if !posted {
      let err = SocketError::state("event loop is not running");
      return shared.base.fail(0, err, addr, port, "send");
    }
    Ok(0)
  }
}

impl Drop for TcpClient {
  fn drop(&mut self) {
    if self.shared.conn.lock().is_some() {
      let _ = self.disconnect_server(DROP_WAIT);
    }
  }
}

impl ClientShared {
  fn callbacks(&self) -> ClientCallbacks {
    self.callbacks.lock().clone()
  }

  fn target(&self) -> (IpAddress, u16) {
    let target = *self.target.lock();
    (target.addr.unwrap_or_default(), target.port)
  }

  fn socket(&self, addr: IpAddress, local_port: u16) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    self.base.config().apply_stream(&socket)?;
    if local_port != 0 {
      socket.set_reuse_address(true)?;
    }
    let local: SockAddr = IpAddress::unspecified(addr.is_ipv6()).socket_addr(local_port).into();
    socket.bind(&local)?;
    Ok(socket)
  }

  fn reader(&self, leftover: &[u8]) -> Reader {
    let framing = self.websocket.then(|| {
      let mut decoder = FrameDecoder::new(Role::Client, self.base.max_buffer_len());
      decoder.extend(leftover);
      decoder
    });
    Reader::new(self.base.max_buffer_len(), self.base.config().max_transient_errors, framing)
  }

  fn connect_sync(self: &Arc<Self>, addr: IpAddress, port: u16, local_port: u16) -> io::Result<()> {
    let socket = self.socket(addr, local_port)?;
    socket.connect(&addr.socket_addr(port).into())?;
    socket.set_nonblocking(true)?;
    let stream = Arc::new(TcpStream::from(socket));

    let leftover = if self.websocket {
      handshake::client_handshake(&stream, &addr, port, self.base.config().handshake_timeout)?
    } else {
      Vec::new()
    };

    let conn = Connection::new(Arc::clone(&stream));
    let local = split_socket_addr(stream.local_addr()?);
    let reader = self.reader(&leftover);
    let driver = ClientDriver::new(self, &conn, Phase::Open { reader });
    *self.conn.lock() = Some(conn);

    self.event_loop.start("sockline-client")?;
    let token =
      self.event_loop.register(stream.as_raw_fd(), Interest::Read, driver.into_handler())?;
    if let Some(conn) = self.conn.lock().as_mut() {
      conn.token = Some(token);
      conn.local = Some(local);
    }
    if !leftover.is_empty() {
      // Frames that came with the handshake response; a writable event is
      // immediate and lets the driver decode them.
      self.event_loop.rearm(token, Interest::ReadWrite);
    }
    Ok(())
  }

  fn connect_async(
    self: &Arc<Self>,
    addr: IpAddress,
    port: u16,
    local_port: u16,
    on_connect: ClientConnectCallback,
  ) -> io::Result<()> {
    let socket = self.socket(addr, local_port)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.socket_addr(port).into()) {
      Ok(()) => {}
      Err(err)
        if err.raw_os_error() == Some(libc::EINPROGRESS)
          || err.kind() == io::ErrorKind::WouldBlock => {}
      Err(err) => return Err(err),
    }
    let stream = Arc::new(TcpStream::from(socket));

    let conn = Connection::new(Arc::clone(&stream));
    let driver =
      ClientDriver::new(self, &conn, Phase::Connecting { addr, port, on_connect });
    *self.conn.lock() = Some(conn);

    self.event_loop.start("sockline-client")?;
    let token =
      self.event_loop.register(stream.as_raw_fd(), Interest::Write, driver.into_handler())?;
    if let Some(conn) = self.conn.lock().as_mut() {
      conn.token = Some(token);
    }
    Ok(())
  }

  /// Closes the connection, if any, and stops the event loop. Returns false
  /// if the loop did not stop within `wait`.
  fn release(&self, wait: Duration) -> bool {
    let conn = self.conn.lock().take();
    if let Some(conn) = conn {
      if let Some(token) = conn.token {
        self.event_loop.deregister(token);
      }
      let farewell = (self.websocket && conn.local.is_some())
        .then(|| frame::encode_close(Role::Client, DISCONNECT));
      conn.writes.close(&*conn.stream, farewell.as_deref());
      if let Err(err) = conn.stream.shutdown(Shutdown::Both) {
        tracing::trace!(%err, "shutdown of closed connection");
      }
    }
    let stopped = self.event_loop.stop(wait);
    self.base.set_active(false);
    stopped
  }

  /// Whether `stream` is still the current connection.
  fn owns(&self, stream: &Arc<TcpStream>) -> bool {
    self
      .conn
      .lock()
      .as_ref()
      .is_some_and(|conn| Arc::ptr_eq(&conn.stream, stream))
  }

  fn flush_writes(&self, stream: &TcpStream, writes: &WriteQueue) -> Flush {
    let (addr, port) = self.target();
    let sending = self.base.sending_callback();
    writes.flush(stream, sending.as_ref(), |err, _| {
      self.base.report_or_log(err.into(), addr, port, "send");
    })
  }
}

enum Phase {
  /// Waiting for a non-blocking connect to finish.
  Connecting {
    addr: IpAddress,
    port: u16,
    on_connect: ClientConnectCallback,
  },
  Open { reader: Reader },
}

/// Read loop of the single connection.
struct ClientDriver {
  client: Weak<ClientShared>,
  stream: Arc<TcpStream>,
  writes: Arc<WriteQueue>,
  phase: Phase,
}

impl ClientDriver {
  fn new(client: &Arc<ClientShared>, conn: &Connection, phase: Phase) -> Self {
    Self {
      client: Arc::downgrade(client),
      stream: Arc::clone(&conn.stream),
      writes: Arc::clone(&conn.writes),
      phase,
    }
  }

  fn into_handler(mut self) -> impl FnMut(Readiness) -> Option<Interest> + Send + 'static {
    move |ready| {
      let client = self.client.upgrade()?;
      if !client.owns(&self.stream) {
        return None;
      }
      if matches!(self.phase, Phase::Connecting { .. }) {
        self.finish_connect(&client, ready.token)
      } else {
        self.serve(&client, ready)
      }
    }
  }

  fn finish_connect(&mut self, client: &Arc<ClientShared>, token: Token) -> Option<Interest> {
    let Phase::Connecting { addr, port, on_connect } = &self.phase else {
      return None;
    };
    let (addr, port, on_connect) = (*addr, *port, Arc::clone(on_connect));

    let stream = &self.stream;
    let established = match stream.take_error() {
      Ok(Some(err)) | Err(err) => Err(err),
      Ok(None) => stream.peer_addr().map(|_| ()),
    }
    .and_then(|()| {
      if client.websocket {
        handshake::client_handshake(stream, &addr, port, client.base.config().handshake_timeout)
      } else {
        Ok(Vec::new())
      }
    })
    .and_then(|leftover| Ok((leftover, split_socket_addr(stream.local_addr()?))));

    let (leftover, local) = match established {
      Ok(established) => established,
      Err(err) => {
        tracing::debug!(%addr, port, %err, "async connect failed");
        client.release(Duration::ZERO);
        client.base.report_or_log(err.into(), addr, port, "connect");
        on_connect(false);
        return None;
      }
    };

    if let Some(conn) = client.conn.lock().as_mut() {
      conn.local = Some(local);
    }
    self.phase = Phase::Open { reader: client.reader(&leftover) };
    tracing::info!(%addr, port, websocket = client.websocket, "connected");

    if !on_connect(true) {
      tracing::debug!("connect callback declined the connection");
      client.release(Duration::ZERO);
      return None;
    }
    self.serve(client, Readiness { token, readable: true, writable: false })
  }

  fn serve(&mut self, client: &ClientShared, ready: Readiness) -> Option<Interest> {
    let Phase::Open { reader } = &mut self.phase else {
      return None;
    };
    let (addr, port) = client.target();

    if ready.writable {
      client.flush_writes(&self.stream, &self.writes);
    }

    // A writable event may also stand for frames buffered during the
    // handshake, so WebSocket connections always decode.
    if ready.readable || reader.is_websocket() {
      let getting = client.callbacks().getting;
      let lost = reader.pump(
        &*self.stream,
        |data| {
          if let Some(getting) = &getting {
            getting(data);
          }
        },
        |err| client.base.report_or_log(err.into(), addr, port, "receive"),
      );
      if let Some(err) = lost {
        return connection_lost(client, &self.stream, err);
      }
    }

    Some(Interest::read_and(!self.writes.is_empty()))
  }
}

/// Tears the connection down from the loop thread and tells the lost
/// callback.
fn connection_lost(client: &ClientShared, stream: &Arc<TcpStream>, err: io::Error) -> Option<Interest> {
  if !client.owns(stream) {
    return None;
  }
  let (addr, port) = client.target();
  tracing::debug!(%addr, port, %err, "connection lost");
  client.base.report_or_log(err.into(), addr, port, "receive");

  let conn = client.conn.lock().take();
  if let Some(conn) = conn {
    conn.writes.close(&*conn.stream, None);
    let _ = conn.stream.shutdown(Shutdown::Both);
  }
  client.event_loop.stop(Duration::ZERO);
  client.base.set_active(false);

  if let Some(lost) = client.callbacks().lost {
    lost();
  }
  None
}
