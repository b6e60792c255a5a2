use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use crate::callback::Handle;
use crate::reactor::Token;
use crate::send::WriteQueue;
use crate::IpAddress;
use crate::ws::frame::{self, Role};

/// Addresses of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
  pub peer_addr: IpAddress,
  pub peer_port: u16,
  pub local_addr: IpAddress,
  pub local_port: u16,
}

/// One live connection owned by a server's table.
pub(crate) struct ConnectionRecord {
  pub info: ConnectionInfo,
  pub stream: Arc<TcpStream>,
  pub writes: Arc<WriteQueue>,
  pub websocket: bool,
  pub token: Option<Token>,
}

impl ConnectionRecord {
  pub fn new(info: ConnectionInfo, stream: Arc<TcpStream>, websocket: bool) -> Self {
    Self {
      info,
      stream,
      writes: Arc::new(WriteQueue::new()),
      websocket,
      token: None,
    }
  }

  /// Whether `stream` is this record's transport.
  pub fn owns(&self, stream: &Arc<TcpStream>) -> bool {
    Arc::ptr_eq(&self.stream, stream)
  }

  /// Shuts the transport down, swallowing failures. Never waits on the peer:
  /// WebSocket peers get a close frame carrying `reason` only if it fits in
  /// the socket right away.
  pub fn close(&self, reason: Option<&str>) {
    let farewell = reason
      .filter(|_| self.websocket)
      .map(|reason| frame::encode_close(Role::Server, reason));
    self.writes.close(&*self.stream, farewell.as_deref());
    if let Err(err) = self.stream.shutdown(Shutdown::Both) {
      tracing::trace!(%err, "shutdown of closed connection");
    }
  }
}

/// Connection records keyed by handle.
///
/// New records take the smallest handle not in use, so handles are dense and
/// get reused after removal.
#[derive(Default)]
pub(crate) struct ConnectionTable {
  entries: BTreeMap<Handle, ConnectionRecord>,
}

impl ConnectionTable {
  pub fn insert(&mut self, record: ConnectionRecord) -> Handle {
    let mut handle: Handle = 0;
    for &used in self.entries.keys() {
      if used != handle {
        break;
      }
      handle += 1;
    }
    self.entries.insert(handle, record);
    handle
  }

  pub fn get(&self, handle: Handle) -> Option<&ConnectionRecord> {
    self.entries.get(&handle)
  }

  pub fn get_mut(&mut self, handle: Handle) -> Option<&mut ConnectionRecord> {
    self.entries.get_mut(&handle)
  }

  pub fn remove(&mut self, handle: Handle) -> Option<ConnectionRecord> {
    self.entries.remove(&handle)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn handle_of(&self, addr: &IpAddress, port: u16) -> Option<Handle> {
    self
      .entries
      .iter()
      .find(|(_, record)| record.info.peer_addr == *addr && record.info.peer_port == port)
      .map(|(&handle, _)| handle)
  }

  pub fn infos(&self) -> Vec<(Handle, ConnectionInfo)> {
    self.entries.iter().map(|(&handle, record)| (handle, record.info)).collect()
  }

  pub fn drain(&mut self) -> Vec<(Handle, ConnectionRecord)> {
    std::mem::take(&mut self.entries).into_iter().collect()
  }
}
