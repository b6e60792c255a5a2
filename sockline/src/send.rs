//! Send chains.
//!
//! Every send on a connection goes through its [`WriteQueue`], so bytes reach
//! the wire in the order the sends were made. An async send copies the
//! caller's buffer into the queue. The event loop writes as much as the socket
//! takes whenever it is writable and runs the sending callback after every
//! attempt. A partially written buffer is retried while the callback keeps
//! returning true. Without a callback the whole buffer is always written. A
//! transport error ends the chain for that buffer: the error is reported and
//! the callback sees `sent == 0`.
//!
//! WebSocket frames are always written whole; the callback only learns about
//! payload bytes and its answer is ignored. A synchronous send queues its
//! buffer behind whatever is pending and drives the queue from the calling
//! thread until its own entry is out.
//!
//! Writers take the queue's strand for one non-blocking pass at a time, never
//! while waiting for the socket. Sending callbacks run inside that pass and
//! must not make synchronous sends on the same connection.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::callback::{Handle, SendProgress, SendingCallback};
use crate::io::{WriteSink, wait_ready};
use crate::reactor::Strand;
use crate::sync::Mutex;

/// How long a synchronous sender sleeps on a full socket before looking at
/// its entry again. The loop thread may finish it meanwhile.
const BLOCKING_SLICE: Duration = Duration::from_millis(50);

enum Delivery {
  /// Async buffer; the sending callback may abandon the rest.
  Chain,
  /// Async WebSocket frame. `masked` keeps the caller's payload when the
  /// frame bytes no longer contain it verbatim.
  Frame { header: usize, masked: Option<Vec<u8>> },
  /// A synchronous send waiting on the other end of `done`.
  Blocking { header: usize, done: Sender<io::Result<usize>> },
}

struct PendingWrite {
  buffer: Vec<u8>,
  offset: usize,
  retry: u32,
  handle: Handle,
  target: Option<SocketAddr>,
  delivery: Delivery,
}

impl PendingWrite {
  fn header(&self) -> usize {
    match &self.delivery {
      Delivery::Chain => 0,
      Delivery::Frame { header, .. } | Delivery::Blocking { header, .. } => *header,
    }
  }

  /// What the caller handed to `send`.
  fn payload(&self) -> &[u8] {
    match &self.delivery {
      Delivery::Frame { masked: Some(payload), .. } => payload,
      _ => &self.buffer[self.header()..],
    }
  }

  /// Reports a successful write that started at `before`. Returns whether the
  /// rest of the entry should still go out.
  fn progress(&mut self, before: usize, sending: Option<&SendingCallback>) -> bool {
    let header = self.header();
    let sent = self.offset.saturating_sub(header) - before.saturating_sub(header);
    let answer = match sending {
      Some(callback) if sent > 0 && !matches!(self.delivery, Delivery::Blocking { .. }) => {
        callback(SendProgress {
          sent,
          retry: self.retry,
          handle: self.handle,
          buffer: self.payload(),
        })
      }
      _ => true,
    };
    self.retry += 1;
    answer || !matches!(self.delivery, Delivery::Chain)
  }

  fn finish(&self) {
    if let Delivery::Blocking { header, done } = &self.delivery {
      let _ = done.send(Ok(self.buffer.len() - header));
    }
  }

  fn fail(
    &self,
    err: io::Error,
    sending: Option<&SendingCallback>,
    on_error: &mut impl FnMut(io::Error, Option<SocketAddr>),
  ) {
    if let Delivery::Blocking { done, .. } = &self.delivery {
      let _ = done.send(Err(err));
      return;
    }
    if let Some(callback) = sending {
      callback(SendProgress {
        sent: 0,
        retry: self.retry,
        handle: self.handle,
        buffer: self.payload(),
      });
    }
    on_error(err, self.target);
  }
}

/// Outgoing bytes of one socket.
pub(crate) struct WriteQueue {
  pending: Mutex<VecDeque<PendingWrite>>,
  /// Set under the `pending` lock; a closed queue takes no more entries.
  closed: AtomicBool,
  strand: Strand,
}

/// Result of [`WriteQueue::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
  /// Nothing left to write.
  Drained,
  /// The socket is full; wait for writability.
  Blocked,
}

impl WriteQueue {
  pub fn new() -> Self {
    Self {
      pending: Mutex::new(VecDeque::new()),
      closed: AtomicBool::new(false),
      strand: Strand::new(),
    }
  }

  fn enqueue(&self, buffer: Vec<u8>, handle: Handle, target: Option<SocketAddr>, delivery: Delivery) {
    let mut pending = self.pending.lock();
    if self.closed.load(Ordering::Acquire) {
      return;
    }
    pending.push_back(PendingWrite {
      buffer,
      offset: 0,
      retry: 0,
      handle,
      target,
      delivery,
    });
  }

  pub fn push(&self, buffer: Vec<u8>, handle: Handle, target: Option<SocketAddr>) {
    self.enqueue(buffer, handle, target, Delivery::Chain);
  }

  /// Queues an encoded WebSocket frame whose first `header` bytes are framing.
  /// Pass the payload as `masked` when the frame carries it masked.
  pub fn push_frame(
    &self,
    frame: Vec<u8>,
    header: usize,
    masked: Option<Vec<u8>>,
    handle: Handle,
  ) {
    self.enqueue(frame, handle, None, Delivery::Frame { header, masked });
  }

  pub fn is_empty(&self) -> bool {
    self.pending.lock().is_empty()
  }

  /// Drops everything still queued; the queue stays usable.
  pub fn clear(&self) {
    self.pending.lock().clear();
  }

  /// Writes queued buffers in order until the queue drains or the socket
  /// would block. Transport errors of async entries go to `on_error` with the
  /// destination of the failing buffer.
  ///
  /// The queue lock is only held to pop and push entries, never while the
  /// sending callback runs.
  pub fn flush<S: WriteSink + ?Sized>(
    &self,
    sink: &S,
    sending: Option<&SendingCallback>,
    mut on_error: impl FnMut(io::Error, Option<SocketAddr>),
  ) -> Flush {
    self.strand.run(|| loop {
      let Some(mut entry) = self.pending.lock().pop_front() else {
        return Flush::Drained;
      };

      loop {
        match sink.write_to(&entry.buffer[entry.offset..], entry.target) {
          Ok(0) => {
            entry.fail(io::ErrorKind::WriteZero.into(), sending, &mut on_error);
            break;
          }
          Ok(n) => {
            let before = entry.offset;
            entry.offset += n;
            let keep_going = entry.progress(before, sending);

            if entry.offset >= entry.buffer.len() {
              entry.finish();
              break;
            }
            if !keep_going {
              tracing::debug!(
                sent = entry.offset,
                full = entry.buffer.len(),
                "sending callback abandoned partial write"
              );
              break;
            }
          }
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
              return Flush::Drained;
            }
            pending.push_front(entry);
            return Flush::Blocked;
          }
          Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
          Err(err) => {
            entry.fail(err, sending, &mut on_error);
            break;
          }
        }
      }
    })
  }

  /// Queues `buffer` behind everything pending and writes from the calling
  /// thread until it is out. The first `header` bytes are framing and are not
  /// counted in the returned length.
  ///
  /// Entries ahead of it are flushed along the way, with their usual
  /// callback and error handling.
  pub fn write_blocking<S: WriteSink + ?Sized>(
    &self,
    sink: &S,
    buffer: Vec<u8>,
    header: usize,
    handle: Handle,
    sending: Option<&SendingCallback>,
    mut on_error: impl FnMut(io::Error, Option<SocketAddr>),
  ) -> io::Result<usize> {
    let (done_tx, done): (_, Receiver<io::Result<usize>>) = crossbeam_channel::bounded(1);
    self.enqueue(buffer, handle, None, Delivery::Blocking { header, done: done_tx });

    loop {
      self.flush(sink, sending, &mut on_error);
      match done.try_recv() {
        Ok(res) => return res,
        Err(TryRecvError::Disconnected) => {
          return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection closed before the send finished",
          ));
        }
        Err(TryRecvError::Empty) => {}
      }
      wait_ready(sink.as_raw_fd(), true, Some(BLOCKING_SLICE))?;
    }
  }

  /// Drops everything queued and refuses later entries. Unless another
  /// thread is writing or a buffer is halfway out, `last` gets one
  /// non-blocking write attempt. Synchronous senders still waiting fail.
  pub fn close<S: WriteSink + ?Sized>(&self, sink: &S, last: Option<&[u8]>) {
    let attempted = self.strand.try_run(|| {
      if !self.shut() && let Some(last) = last {
        let _ = sink.write_to(last, None);
      }
    });
    if attempted.is_none() {
      tracing::trace!("writer busy, closing without a final write");
      self.shut();
    }
  }

  /// Marks the queue closed and empties it. Returns whether a buffer was
  /// halfway out.
  fn shut(&self) -> bool {
    let dropped = {
      let mut pending = self.pending.lock();
      self.closed.store(true, Ordering::Release);
      std::mem::take(&mut *pending)
    };
    dropped.front().is_some_and(|entry| entry.offset > 0)
  }
}
