//! TCP server.
//!
//! The listener and every accepted connection are registrations on the
//! server's event loop. Each connection is driven by a [`Driver`] that reads
//! into a buffer of the configured maximum length, hands the data to the
//! getting callback and flushes queued async writes when the socket turns
//! writable. In WebSocket mode the driver first completes the upgrade
//! handshake and only then admits the connection into the table. Upgrades in
//! progress count against the connection limit and are dropped once the
//! handshake timeout passes.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::addr::split_socket_addr;
use crate::base::SocketBase;
use crate::callback::{
  ErrorCallback, Handle, SendProgress, ServerConnectCallback, ServerGettingCallback,
  ServerLostCallback,
};
use crate::config::SocketConfig;
use crate::connection::{ConnectionInfo, ConnectionRecord, ConnectionTable};
use crate::io::{WriteSink, write_all_blocking};
use crate::poll::Interest;
use crate::reactor::{EventLoop, Readiness, Token};
use crate::send::{Flush, WriteQueue};
use crate::sync::Mutex;
use crate::ws::frame::{FrameDecoder, Role};
use crate::ws::handshake::{self, MAX_HEAD_LEN, REJECTION};
use crate::ws;
use crate::{IpAddress, Result, SocketError};

use super::Reader;

/// Close reason sent to WebSocket peers that are given up.
const KICKED_OUT: &str = "Kicked out";
/// How long dropping a listening server waits for its loop thread.
const DROP_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct ServerCallbacks {
  connect: Option<ServerConnectCallback>,
  lost: Option<ServerLostCallback>,
  getting: Option<ServerGettingCallback>,
}

struct Listening {
  token: Token,
  addr: IpAddress,
  port: u16,
}

/// An accepted WebSocket peer that has not finished its upgrade yet.
struct PendingHandshake {
  deadline: Instant,
  stream: Arc<TcpStream>,
  info: ConnectionInfo,
}

struct ServerShared {
  base: SocketBase,
  event_loop: EventLoop,
  table: Mutex<ConnectionTable>,
  handshakes: Mutex<HashMap<Token, PendingHandshake>>,
  listening: Mutex<Option<Listening>>,
  max_connections: AtomicUsize,
  websocket: AtomicBool,
  callbacks: Mutex<ServerCallbacks>,
}

/// A TCP server assigning a [`Handle`] to every accepted connection.
///
/// ```no_run
/// use sockline::TcpServer;
///
/// let server = TcpServer::new()?;
/// server.set_getting_callback(|handle, data| {
///   println!("{handle}: {} bytes", data.len());
/// });
/// server.start(9000, false)?;
/// # Ok::<(), sockline::SocketError>(())
/// ```
pub struct TcpServer {
  shared: Arc<ServerShared>,
}

impl TcpServer {
  pub fn new() -> Result<Self> {
    Self::with_config(SocketConfig::default())
  }

  pub fn with_config(config: SocketConfig) -> Result<Self> {
    let max_connections = config.max_connections;
    Ok(Self {
      shared: Arc::new(ServerShared {
        event_loop: EventLoop::new()?,
        base: SocketBase::new(config),
        table: Mutex::new(ConnectionTable::default()),
        handshakes: Mutex::new(HashMap::new()),
        listening: Mutex::new(None),
        max_connections: AtomicUsize::new(max_connections),
        websocket: AtomicBool::new(false),
        callbacks: Mutex::new(ServerCallbacks::default()),
      }),
    })
  }

  /// Called once per admitted connection. Returning false closes it again
  /// before any data is delivered.
  pub fn set_connect_callback(
    &self,
    callback: impl Fn(Handle) -> bool + Send + Sync + 'static,
  ) {
    self.shared.callbacks.lock().connect = Some(Arc::new(callback));
  }

  /// Called when a peer goes away. Not called for connections the server
  /// gives up itself.
  ///
  /// A connection whose reads keep failing counts as gone too: once more
  /// than [`SocketConfig::max_transient_errors`] receive errors happen in a
  /// row, each of them reported, the connection is closed and this callback
  /// runs even though the peer never closed it.
  pub fn set_lost_callback(&self, callback: impl Fn(Handle) + Send + Sync + 'static) {
    self.shared.callbacks.lock().lost = Some(Arc::new(callback));
  }

  pub fn set_getting_callback(
    &self,
    callback: impl Fn(Handle, &[u8]) + Send + Sync + 'static,
  ) {
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

  /// Refused with `false` while listening.
  pub fn set_max_buffer_len(&self, len: usize) -> bool {
    self.shared.base.set_max_buffer_len(len)
  }

  pub fn max_connections(&self) -> usize {
    self.shared.max_connections.load(Ordering::Acquire)
  }

  /// Refused with `false` while listening or for zero.
  pub fn set_max_connections(&self, max: usize) -> bool {
    if max == 0 || self.is_listening() {
      return false;
    }
    self.shared.max_connections.store(max, Ordering::Release);
    true
  }

  pub fn is_listening(&self) -> bool {
    self.shared.base.is_active()
  }

  pub fn is_websocket(&self) -> bool {
    self.shared.websocket.load(Ordering::Acquire)
  }

  /// Address the listener is bound to.
  pub fn local_addr(&self) -> Option<IpAddress> {
    self.shared.listening.lock().as_ref().map(|l| l.addr)
  }

  /// Port the listener is bound to; useful after starting on port 0.
  pub fn local_port(&self) -> Option<u16> {
    self.shared.listening.lock().as_ref().map(|l| l.port)
  }

  pub fn connection_count(&self) -> usize {
    self.shared.table.lock().len()
  }

  pub fn client_info(&self, handle: Handle) -> Option<ConnectionInfo> {
    self.shared.table.lock().get(handle).map(|record| record.info)
  }

  /// Every live connection, ordered by handle.
  pub fn all_clients(&self) -> Vec<(Handle, ConnectionInfo)> {
    self.shared.table.lock().infos()
  }

  pub fn handle_of(&self, addr: &IpAddress, port: u16) -> Option<Handle> {
    self.shared.table.lock().handle_of(addr, port)
  }

  /// Binds `port` on the wildcard address of the chosen family and starts
  /// accepting. Port 0 picks an ephemeral port.
  ///
  /// Fails with a socket state error if already listening.
  pub fn start(&self, port: u16, ipv6: bool) -> Result<bool> {
    self.start_with(port, ipv6, false)
  }

  pub(crate) fn start_with(&self, port: u16, ipv6: bool, websocket: bool) -> Result<bool> {
    let shared = &self.shared;
    let wildcard = IpAddress::unspecified(ipv6);
    if !shared.base.try_activate() {
      let err = SocketError::state("server is already listening");
      return shared.base.fail(false, err, wildcard, port, "start");
    }

    match shared.listen(port, ipv6, websocket) {
      Ok(listening) => {
        tracing::info!(
          addr = %listening.addr,
          port = listening.port,
          websocket,
          "server listening"
        );
        *shared.listening.lock() = Some(listening);
        Ok(true)
      }
      Err(err) => {
        shared.event_loop.stop(DROP_WAIT);
        shared.base.set_active(false);
        shared.base.fail(false, err.into(), wildcard, port, "start")
      }
    }
  }

  /// Stops accepting, gives up every connection and stops the event loop,
  /// waiting at most `wait` for it.
  ///
  /// Returns `Ok(false)` if the server was not listening or the loop did not
  /// finish in time.
  pub fn stop(&self, wait: Duration) -> Result<bool> {
    let shared = &self.shared;
    let Some(listening) = shared.listening.lock().take() else {
      let err = SocketError::state("server is not listening");
      return shared.base.fail(false, err, IpAddress::default(), 0, "stop");
    };

    shared.event_loop.deregister(listening.token);
    shared.abandon_handshakes();
    self.give_up_all_clients();
    let stopped = shared.event_loop.stop(wait);
    shared.base.set_active(false);

    if !stopped {
      let err = SocketError::state(format!("event loop did not stop within {wait:?}"));
      return shared.base.fail(false, err, listening.addr, listening.port, "stop");
    }
    tracing::info!(port = listening.port, "server stopped");
    Ok(true)
  }

  /// Sends `data` to the connection `handle`.
  ///
  /// A synchronous send blocks until everything is written and returns the
  /// byte count. An asynchronous send copies the data, returns `Ok(0)` at once
  /// and reports progress to the sending callback. An unknown handle sends
  /// nothing and yields `Ok(0)`.
  ///
  /// Both kinds share one queue per connection, so data goes out in the order
  /// of the calls. A synchronous send made from a callback holds up the event
  /// loop until the peer has taken the data.
  pub fn send(&self, handle: Handle, data: &[u8], is_async: bool) -> Result<usize> {
    let shared = &self.shared;
    if data.is_empty() {
      let err = SocketError::invalid_argument("send buffer is empty");
      return shared.base.fail(0, err, IpAddress::default(), 0, "send");
    }

    let (info, stream, writes, websocket, token) = {
      let table = shared.table.lock();
      let Some(record) = table.get(handle) else {
        tracing::debug!(handle, "send to unknown handle");
        return Ok(0);
      };
      (
        record.info,
        Arc::clone(&record.stream),
        Arc::clone(&record.writes),
        record.websocket,
        record.token,
      )
    };
    let (buffer, header) = if websocket {
      ws::binary_frame(data, Role::Server)
    } else {
      (data.to_vec(), 0)
    };

    if !is_async {
      let sending = shared.base.sending_callback();
      let res = writes.write_blocking(&*stream, buffer, header, handle, sending.as_ref(), |err, _| {
        shared.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "send");
      });
      return match res {
        Ok(n) => Ok(n),
        Err(err) => shared.base.fail(0, err.into(), info.peer_addr, info.peer_port, "send"),
      };
    }

    if websocket {
      writes.push_frame(buffer, header, None, handle);
    } else {
      writes.push(buffer, handle, None);
    }
    let server = Arc::downgrade(shared);
    let posted = shared.event_loop.post(move || {
      let Some(server) = server.upgrade() else { return };
      if server.flush_writes(&stream, &writes, info) == Flush::Blocked
        && let Some(token) = token
      {
        server.event_loop.rearm(token, Interest::ReadWrite);
      }
    });

    if !posted {
      let err = SocketError::state("event loop is not running");
      return shared.base.fail(0, err, info.peer_addr, info.peer_port, "send");
    }
    Ok(0)
  }

  /// Closes the connection `handle` without calling the lost callback.
  /// WebSocket peers receive a close frame first. Returns false for an
  /// unknown handle.
  pub fn give_up_client(&self, handle: Handle) -> bool {
    let Some(record) = self.shared.table.lock().remove(handle) else {
      return false;
    };
    tracing::debug!(handle, peer = %record.info.peer_addr, "giving up client");
    self.shared.drop_record(record, Some(KICKED_OUT));
    true
  }

  pub fn give_up_client_by_addr(&self, addr: &IpAddress, port: u16) -> bool {
    match self.handle_of(addr, port) {
      Some(handle) => self.give_up_client(handle),
      None => false,
    }
  }

  /// Gives up every connection. Returns true once the table is empty.
  pub fn give_up_all_clients(&self) -> bool {
    let records = self.shared.table.lock().drain();
    if !records.is_empty() {
      tracing::debug!(count = records.len(), "giving up all clients");
    }
    for (_, record) in records {
      self.shared.drop_record(record, Some(KICKED_OUT));
    }
    self.shared.table.lock().len() == 0
  }
}

impl Drop for TcpServer {
  fn drop(&mut self) {
    if self.shared.listening.lock().is_some() {
      let _ = self.stop(DROP_WAIT);
    }
  }
}

impl ServerShared {
  fn callbacks(&self) -> ServerCallbacks {
    self.callbacks.lock().clone()
  }

  fn listen(self: &Arc<Self>, port: u16, ipv6: bool, websocket: bool) -> io::Result<Listening> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if ipv6 {
      socket.set_only_v6(true)?;
    }
    self.base.config().apply_buffer_sizes(&socket)?;
    socket.bind(&IpAddress::unspecified(ipv6).socket_addr(port).into())?;

    let backlog = self.max_connections.load(Ordering::Acquire).min(i32::MAX as usize);
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;

    let listener = Arc::new(TcpListener::from(socket));
    let (addr, port) = split_socket_addr(listener.local_addr()?);
    self.websocket.store(websocket, Ordering::Release);

    self.event_loop.start("sockline-server")?;
    if websocket {
      let server = Arc::downgrade(self);
      self.event_loop.on_tick(move || {
        if let Some(server) = server.upgrade() {
          server.expire_handshakes();
        }
      });
    }
    let token = self.event_loop.register(
      listener.as_raw_fd(),
      Interest::Read,
      accept_loop(Arc::downgrade(self), listener),
    )?;
    Ok(Listening { token, addr, port })
  }

  /// Runs on the loop thread for every accepted stream.
  fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
    let (peer_addr, peer_port) = split_socket_addr(peer);
    let prepared = stream
      .set_nonblocking(true)
      .and_then(|()| self.base.config().apply_stream(&SockRef::from(&stream)));
    if let Err(err) = prepared {
      self.base.report_or_log(err.into(), peer_addr, peer_port, "accept");
      return;
    }

    let max = self.max_connections.load(Ordering::Acquire);
    let pending = self.handshakes.lock().len();
    if self.table.lock().len() + pending >= max {
      let _ = stream.shutdown(Shutdown::Both);
      let err = SocketError::state(format!("connection limit of {max} reached"));
      self.base.report_or_log(err, peer_addr, peer_port, "accept");
      return;
    }

    let (local_addr, local_port) =
      stream.local_addr().map(split_socket_addr).unwrap_or_default();
    let info = ConnectionInfo { peer_addr, peer_port, local_addr, local_port };
    let stream = Arc::new(stream);
    let fd = stream.as_raw_fd();

    if self.websocket.load(Ordering::Acquire) {
      // Joins the table once the upgrade handshake completes.
      let deadline = Instant::now() + self.base.config().handshake_timeout;
      let driver = Driver::new(self, Arc::clone(&stream), info, Phase::Handshake {
        head: Vec::new(),
        deadline,
      });
      match self.event_loop.register(fd, Interest::Read, driver.into_handler()) {
        Ok(token) => {
          let pending = PendingHandshake { deadline, stream, info };
          self.handshakes.lock().insert(token, pending);
        }
        Err(err) => self.base.report_or_log(err.into(), peer_addr, peer_port, "accept"),
      }
      return;
    }

    let (handle, writes) = self.insert(&stream, info, false, None);
    let reader = self.reader(None);
    let driver = Driver::new(self, Arc::clone(&stream), info, Phase::Open {
      handle,
      writes,
      reader,
    });
    match self.event_loop.register(fd, Interest::Read, driver.into_handler()) {
      Ok(token) => {
        if let Some(record) = self.table.lock().get_mut(handle) {
          record.token = Some(token);
        }
      }
      Err(err) => {
        if let Some(record) = self.remove_owned(handle, &stream) {
          record.close(None);
        }
        self.base.report_or_log(err.into(), peer_addr, peer_port, "accept");
        return;
      }
    }

    tracing::debug!(handle, peer = %peer_addr, port = peer_port, "connection accepted");
    self.confirm(handle, &stream);
  }

  fn insert(
    &self,
    stream: &Arc<TcpStream>,
    info: ConnectionInfo,
    websocket: bool,
    token: Option<Token>,
  ) -> (Handle, Arc<WriteQueue>) {
    let mut record = ConnectionRecord::new(info, Arc::clone(stream), websocket);
    record.token = token;
    let writes = Arc::clone(&record.writes);
    (self.table.lock().insert(record), writes)
  }

  /// Runs the connect callback. A rejected connection is removed and closed.
  fn confirm(&self, handle: Handle, stream: &Arc<TcpStream>) -> bool {
    let Some(connect) = self.callbacks().connect else {
      return true;
    };
    if connect(handle) {
      return true;
    }

    tracing::debug!(handle, "connection rejected by connect callback");
    if let Some(record) = self.remove_owned(handle, stream) {
      self.drop_record(record, None);
    }
    false
  }

  /// Removes `handle` only if it still refers to `stream`; the handle may
  /// have been given up and reused meanwhile.
  fn remove_owned(&self, handle: Handle, stream: &Arc<TcpStream>) -> Option<ConnectionRecord> {
    let mut table = self.table.lock();
    if table.get(handle).is_some_and(|record| record.owns(stream)) {
      table.remove(handle)
    } else {
      None
    }
  }

  fn drop_record(&self, record: ConnectionRecord, reason: Option<&str>) {
    if let Some(token) = record.token {
      self.event_loop.deregister(token);
    }
    record.close(reason);
  }

  fn flush_writes(&self, stream: &TcpStream, writes: &WriteQueue, info: ConnectionInfo) -> Flush {
    let sending = self.base.sending_callback();
    writes.flush(stream, sending.as_ref(), |err, _| {
      self.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "send");
    })
  }

  fn reader(&self, framing: Option<FrameDecoder>) -> Reader {
    Reader::new(self.base.max_buffer_len(), self.base.config().max_transient_errors, framing)
  }

  /// Drops upgrades that outlived the handshake timeout. Runs on the loop
  /// thread.
  fn expire_handshakes(&self) {
    let now = Instant::now();
    let expired: Vec<(Token, PendingHandshake)> = {
      let mut handshakes = self.handshakes.lock();
      let tokens: Vec<Token> = handshakes
        .iter()
        .filter(|(_, pending)| pending.deadline <= now)
        .map(|(token, _)| *token)
        .collect();
      tokens
        .into_iter()
        .filter_map(|token| handshakes.remove(&token).map(|pending| (token, pending)))
        .collect()
    };

    for (token, pending) in expired {
      self.event_loop.deregister(token);
      let _ = pending.stream.shutdown(Shutdown::Both);
      let info = pending.info;
      tracing::debug!(peer = %info.peer_addr, port = info.peer_port, "websocket handshake timed out");
      let err = io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out");
      self.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "handshake");
    }
  }

  /// Closes every upgrade still in progress; used when the server stops.
  fn abandon_handshakes(&self) {
    let pending: Vec<(Token, PendingHandshake)> = self.handshakes.lock().drain().collect();
    for (token, pending) in pending {
      self.event_loop.deregister(token);
      let _ = pending.stream.shutdown(Shutdown::Both);
    }
  }
}

fn accept_loop(
  server: Weak<ServerShared>,
  listener: Arc<TcpListener>,
) -> impl FnMut(Readiness) -> Option<Interest> + Send + 'static {
  move |_| {
    let server = server.upgrade()?;
    loop {
      match listener.accept() {
        Ok((stream, peer)) => server.admit(stream, peer),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          let (addr, port) =
            listener.local_addr().map(split_socket_addr).unwrap_or_default();
          server.base.report_or_log(err.into(), addr, port, "accept");
          break;
        }
      }
    }
    Some(Interest::Read)
  }
}

enum Phase {
  /// Collecting the upgrade request.
  Handshake { head: Vec<u8>, deadline: Instant },
  Open {
    handle: Handle,
    writes: Arc<WriteQueue>,
    reader: Reader,
  },
}

/// Per-connection read loop.
struct Driver {
  server: Weak<ServerShared>,
  stream: Arc<TcpStream>,
  info: ConnectionInfo,
  phase: Phase,
}

impl Driver {
  fn new(
    server: &Arc<ServerShared>,
    stream: Arc<TcpStream>,
    info: ConnectionInfo,
    phase: Phase,
  ) -> Self {
    Self { server: Arc::downgrade(server), stream, info, phase }
  }

  fn is_handshaking(&self) -> bool {
    matches!(self.phase, Phase::Handshake { .. })
  }

  fn into_handler(mut self) -> impl FnMut(Readiness) -> Option<Interest> + Send + 'static {
    move |ready| {
      let server = self.server.upgrade()?;
      if !self.is_handshaking() {
        return self.serve(&server, ready);
      }
      let next = self.handshake(&server, ready.token);
      if next.is_none() || !self.is_handshaking() {
        server.handshakes.lock().remove(&ready.token);
      }
      next
    }
  }

  fn handshake(&mut self, server: &Arc<ServerShared>, token: Token) -> Option<Interest> {
    let info = self.info;
    let Phase::Handshake { head, deadline } = &mut self.phase else {
      return None;
    };
    let deadline = *deadline;
    if Instant::now() >= deadline {
      let _ = self.stream.shutdown(Shutdown::Both);
      let err = io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out");
      server.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "handshake");
      return None;
    }

    let mut chunk = [0u8; 1024];
    let n = match (&*self.stream).read(&mut chunk) {
      Ok(0) => {
        tracing::debug!(peer = %info.peer_addr, "peer left during handshake");
        return None;
      }
      Ok(n) => n,
      Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
        return Some(Interest::Read);
      }
      Err(err) => {
        server.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "handshake");
        return None;
      }
    };
    head.extend_from_slice(&chunk[..n]);

    let Some(end) = handshake::head_end(head) else {
      if head.len() > MAX_HEAD_LEN {
        let err = SocketError::invalid_argument("websocket request head too large");
        server.base.report_or_log(err, info.peer_addr, info.peer_port, "handshake");
        return None;
      }
      return Some(Interest::Read);
    };

    let upgraded = handshake::parse_request(&head[..end]).and_then(|accept| {
      let response = handshake::response(&accept);
      write_all_blocking(&*self.stream, response.as_bytes(), None, Some(deadline))
    });
    if let Err(err) = upgraded {
      if err.kind() == io::ErrorKind::InvalidData {
        let _ = self.stream.write_to(REJECTION, None);
      }
      let _ = self.stream.shutdown(Shutdown::Both);
      server.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "handshake");
      return None;
    }
    let leftover = head.split_off(end);

    let (handle, writes) = server.insert(&self.stream, info, true, Some(token));
    tracing::debug!(handle, peer = %info.peer_addr, port = info.peer_port, "websocket connection accepted");
    if !server.confirm(handle, &self.stream) {
      return None;
    }

    let mut decoder = FrameDecoder::new(Role::Server, server.base.max_buffer_len());
    decoder.extend(&leftover);
    self.phase = Phase::Open { handle, writes, reader: server.reader(Some(decoder)) };
    // Frames may have arrived together with the request.
    self.serve(server, Readiness { token, readable: true, writable: false })
  }

  fn serve(&mut self, server: &ServerShared, ready: Readiness) -> Option<Interest> {
    let Phase::Open { handle, writes, reader } = &mut self.phase else {
      return None;
    };
    let handle = *handle;
    let info = self.info;

    if ready.writable {
      server.flush_writes(&self.stream, writes, info);
    }

    if ready.readable {
      let getting = server.callbacks().getting;
      let lost = reader.pump(
        &*self.stream,
        |data| {
          if let Some(getting) = &getting {
            getting(handle, data);
          }
        },
        |err| server.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "receive"),
      );
      if let Some(err) = lost {
        return connection_lost(server, &self.stream, info, handle, err);
      }
    }

    Some(Interest::read_and(!writes.is_empty()))
  }
}

/// Ends a connection the peer dropped. Connections given up meanwhile are
/// left alone.
fn connection_lost(
  server: &ServerShared,
  stream: &Arc<TcpStream>,
  info: ConnectionInfo,
  handle: Handle,
  err: io::Error,
) -> Option<Interest> {
  let ours = server.table.lock().get(handle).is_some_and(|record| record.owns(stream));
  if !ours {
    return None;
  }

  tracing::debug!(handle, peer = %info.peer_addr, port = info.peer_port, %err, "connection lost");
  server.base.report_or_log(err.into(), info.peer_addr, info.peer_port, "receive");
  if let Some(lost) = server.callbacks().lost {
    lost(handle);
  }
  if let Some(record) = server.remove_owned(handle, stream) {
    record.close(None);
  }
  None
}
