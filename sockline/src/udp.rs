//! UDP endpoint.
//!
//! One socket, opened on the first `start_listening` or `send`. While
//! listening, every readable event drains all queued datagrams into the
//! getting callback. Async sends share the socket's registration, which
//! asks for writability only while datagrams are queued.

use std::io;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::addr::split_socket_addr;
use crate::base::SocketBase;
use crate::callback::{ErrorCallback, SendProgress, UdpGettingCallback};
use crate::config::SocketConfig;
use crate::io::write_all_blocking;
use crate::poll::Interest;
use crate::reactor::{EventLoop, Readiness, Token};
use crate::send::{Flush, WriteQueue};
use crate::sync::Mutex;
use crate::{IpAddress, Result, SocketError};

const DROP_WAIT: Duration = Duration::from_secs(5);

struct Bound {
  socket: Arc<UdpSocket>,
  addr: IpAddress,
  port: u16,
  token: Option<Token>,
}

struct UdpShared {
  base: SocketBase,
  event_loop: EventLoop,
  bound: Mutex<Option<Bound>>,
  writes: WriteQueue,
  getting: Mutex<Option<UdpGettingCallback>>,
}

/// A UDP socket that can listen for datagrams and send to any peer.
///
/// ```no_run
/// use sockline::{IpAddress, UdpEndpoint};
///
/// let udp = UdpEndpoint::new()?;
/// udp.set_getting_callback(|addr, port, data| {
///   println!("{addr}:{port} sent {} bytes", data.len());
/// });
/// udp.start_listening_on(9001, false)?;
/// udp.send(&IpAddress::localhost(false), 9002, b"ping", false)?;
/// # Ok::<(), sockline::SocketError>(())
/// ```
pub struct UdpEndpoint {
  shared: Arc<UdpShared>,
}

impl UdpEndpoint {
  pub fn new() -> Result<Self> {
    Self::with_config(SocketConfig::default())
  }

  pub fn with_config(config: SocketConfig) -> Result<Self> {
    Ok(Self {
      shared: Arc::new(UdpShared {
        event_loop: EventLoop::new()?,
        base: SocketBase::new(config),
        bound: Mutex::new(None),
        writes: WriteQueue::new(),
        getting: Mutex::new(None),
      }),
    })
  }

  pub fn set_getting_callback(
    &self,
    callback: impl Fn(&IpAddress, u16, &[u8]) + Send + Sync + 'static,
  ) {
    *self.shared.getting.lock() = Some(Arc::new(callback));
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

  /// Largest datagram delivered whole; longer ones are truncated. Refused
  /// while listening.
  pub fn set_max_buffer_len(&self, len: usize) -> bool {
    self.shared.base.set_max_buffer_len(len)
  }

  pub fn is_listening(&self) -> bool {
    self.shared.base.is_active()
  }

  pub fn local_addr(&self) -> Option<IpAddress> {
    self.shared.bound.lock().as_ref().map(|bound| bound.addr)
  }

  pub fn local_port(&self) -> Option<u16> {
    self.shared.bound.lock().as_ref().map(|bound| bound.port)
  }

  /// Listens on an ephemeral port of the chosen family.
  pub fn start_listening(&self, ipv6: bool) -> Result<bool> {
    self.start_listening_on(0, ipv6)
  }

  /// Listens on `port`. A socket opened earlier by `send` is reused when it
  /// has the right family and `port` is 0 or its own port.
  pub fn start_listening_on(&self, port: u16, ipv6: bool) -> Result<bool> {
    let shared = &self.shared;
    let wildcard = IpAddress::unspecified(ipv6);
    if !shared.base.try_activate() {
      let err = SocketError::state("endpoint is already listening");
      return shared.base.fail(false, err, wildcard, port, "listen");
    }

    match shared.listen(port, ipv6) {
      Ok((addr, port)) => {
        tracing::info!(%addr, port, "udp endpoint listening");
        Ok(true)
      }
      Err(err) => {
        shared.base.set_active(false);
        shared.base.fail(false, err.into(), wildcard, port, "listen")
      }
    }
  }

  /// Stops receiving, closes the socket and stops the event loop, waiting at
  /// most `wait` for it. Queued async sends are discarded.
  pub fn stop_listening(&self, wait: Duration) -> Result<bool> {
    let shared = &self.shared;
    if !shared.base.is_active() {
      let err = SocketError::state("endpoint is not listening");
      return shared.base.fail(false, err, IpAddress::default(), 0, "stop");
    }

    let (addr, port) = shared.close();
    let stopped = shared.event_loop.stop(wait);
    shared.base.set_active(false);
    if !stopped {
      let err = SocketError::state(format!("event loop did not stop within {wait:?}"));
      return shared.base.fail(false, err, addr, port, "stop");
    }
    tracing::info!(%addr, port, "udp endpoint stopped");
    Ok(true)
  }

  /// Sends one datagram to `addr:port`, opening the socket on demand.
  ///
  /// Synchronous sends return the byte count. Asynchronous ones return
  /// `Ok(0)` and report to the sending callback.
  pub fn send(&self, addr: &IpAddress, port: u16, data: &[u8], is_async: bool) -> Result<usize> {
    let shared = &self.shared;
    if data.is_empty() {
      let err = SocketError::invalid_argument("send buffer is empty");
      return shared.base.fail(0, err, *addr, port, "send");
    }

    let socket = match shared.socket_for(addr.is_ipv6()) {
      Ok(socket) => socket,
      Err(err) => return shared.base.fail(0, err, *addr, port, "send"),
    };
    let target = addr.socket_addr(port);

    if !is_async {
      return match write_all_blocking(&*socket, data, Some(target), None) {
        Ok(n) => Ok(n),
        Err(err) => shared.base.fail(0, err.into(), *addr, port, "send"),
      };
    }

    if let Err(err) = shared.event_loop.start("sockline-udp") {
      return shared.base.fail(0, err.into(), *addr, port, "send");
    }
    let buffer = data.to_vec();
    let udp = Arc::downgrade(shared);
    let posted = shared.event_loop.post(move || {
      let Some(udp) = udp.upgrade() else { return };
      udp.writes.push(buffer, 0, Some(target));
      if udp.flush_writes(&socket) == Flush::Blocked {
        udp.want_writable(&socket);
      }
    });
    if !posted {
      let err = SocketError::state("event loop is not running");
      return shared.base.fail(0, err, *addr, port, "send");
    }
    Ok(0)
  }
}

impl Drop for UdpEndpoint {
  fn drop(&mut self) {
    self.shared.close();
    if !self.shared.event_loop.stop(DROP_WAIT) {
      tracing::warn!("udp event loop did not stop on drop");
    }
  }
}

impl UdpShared {
  fn open(&self, port: u16, ipv6: bool) -> io::Result<Bound> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if ipv6 {
      socket.set_only_v6(true)?;
    }
    self.base.config().apply_buffer_sizes(&socket)?;
    socket.bind(&IpAddress::unspecified(ipv6).socket_addr(port).into())?;
    socket.set_nonblocking(true)?;

    let socket = Arc::new(UdpSocket::from(socket));
    let (addr, port) = split_socket_addr(socket.local_addr()?);
    tracing::debug!(%addr, port, "udp socket opened");
    Ok(Bound { socket, addr, port, token: None })
  }

  /// Returns the socket, opening it or reopening it for another family. A
  /// listening socket is never swapped.
  fn socket_for(&self, ipv6: bool) -> Result<Arc<UdpSocket>> {
    let mut bound = self.bound.lock();
    if let Some(current) = bound.as_ref() {
      if current.addr.is_ipv6() == ipv6 {
        return Ok(Arc::clone(&current.socket));
      }
      if self.base.is_active() {
        return Err(SocketError::state("listening socket has the other IP version"));
      }
    }

    if let Some(old) = bound.take()
      && let Some(token) = old.token
    {
      self.event_loop.deregister(token);
    }
    let fresh = self.open(0, ipv6)?;
    let socket = Arc::clone(&fresh.socket);
    *bound = Some(fresh);
    Ok(socket)
  }

  fn listen(self: &Arc<Self>, port: u16, ipv6: bool) -> io::Result<(IpAddress, u16)> {
    let mut bound = self.bound.lock();
    let reusable = bound
      .as_ref()
      .is_some_and(|b| b.addr.is_ipv6() == ipv6 && (port == 0 || b.port == port));
    if !reusable {
      if let Some(old) = bound.take()
        && let Some(token) = old.token
      {
        self.event_loop.deregister(token);
      }
      *bound = Some(self.open(port, ipv6)?);
    }
    let Some(current) = bound.as_mut() else {
      return Err(io::ErrorKind::NotConnected.into());
    };

    self.event_loop.start("sockline-udp")?;
    let interest = self.interest();
    match current.token {
      Some(token) => {
        self.event_loop.rearm(token, interest);
      }
      None => {
        let handler = receive_loop(Arc::downgrade(self), Arc::clone(&current.socket));
        current.token =
          Some(self.event_loop.register(current.socket.as_raw_fd(), interest, handler)?);
      }
    }
    Ok((current.addr, current.port))
  }

  /// Drops the socket and everything queued for it.
  fn close(&self) -> (IpAddress, u16) {
    let bound = self.bound.lock().take();
    self.writes.clear();
    match bound {
      Some(bound) => {
        if let Some(token) = bound.token {
          self.event_loop.deregister(token);
        }
        (bound.addr, bound.port)
      }
      None => (IpAddress::default(), 0),
    }
  }

  fn interest(&self) -> Interest {
    Interest::read_and(!self.writes.is_empty())
  }

  fn owns(&self, socket: &Arc<UdpSocket>) -> bool {
    self.bound.lock().as_ref().is_some_and(|b| Arc::ptr_eq(&b.socket, socket))
  }

  /// Makes sure the socket's registration waits for writability. Runs on the
  /// loop thread.
  fn want_writable(self: &Arc<Self>, socket: &Arc<UdpSocket>) {
    let mut bound = self.bound.lock();
    let Some(current) = bound.as_mut().filter(|b| Arc::ptr_eq(&b.socket, socket)) else {
      return;
    };
    let interest = self.interest();
    match current.token {
      Some(token) => {
        self.event_loop.rearm(token, interest);
      }
      None => {
        let handler = receive_loop(Arc::downgrade(self), Arc::clone(socket));
        match self.event_loop.register(socket.as_raw_fd(), interest, handler) {
          Ok(token) => current.token = Some(token),
          Err(err) => {
            let (addr, port) = (current.addr, current.port);
            drop(bound);
            self.base.report_or_log(err.into(), addr, port, "send");
          }
        }
      }
    }
  }

  fn flush_writes(&self, socket: &UdpSocket) -> Flush {
    let sending = self.base.sending_callback();
    self.writes.flush(socket, sending.as_ref(), |err, target| {
      let (addr, port) = target.map(split_socket_addr).unwrap_or_default();
      self.base.report_or_log(err.into(), addr, port, "send");
    })
  }

  /// Drains every queued datagram. Datagrams arriving on a socket that was
  /// only opened for sending are dropped.
  fn receive(&self, socket: &UdpSocket, buf: &mut [u8]) {
    let getting = self.getting.lock().clone();
    loop {
      match socket.recv_from(buf) {
        Ok((n, from)) => {
          let (addr, port) = split_socket_addr(from);
          match &getting {
            Some(getting) if self.base.is_active() => getting(&addr, port, &buf[..n]),
            _ => tracing::trace!(%addr, port, len = n, "dropping datagram"),
          }
          buf[..n].fill(0);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          // ICMP errors from earlier sends surface here; keep receiving.
          let (addr, port) = socket.local_addr().map(split_socket_addr).unwrap_or_default();
          self.base.report_or_log(err.into(), addr, port, "receive");
          break;
        }
      }
    }
  }
}

fn receive_loop(
  udp: Weak<UdpShared>,
  socket: Arc<UdpSocket>,
) -> impl FnMut(Readiness) -> Option<Interest> + Send + 'static {
  let mut buf: Vec<u8> = Vec::new();
  move |ready| {
    let udp = udp.upgrade()?;
    if !udp.owns(&socket) {
      return None;
    }

    if ready.writable {
      udp.flush_writes(&socket);
    }
    if ready.readable {
      buf.resize(udp.base.max_buffer_len(), 0);
      udp.receive(&socket, &mut buf);
    }
    Some(udp.interest())
  }
}
