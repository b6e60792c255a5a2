//! Per-socket event loop.
//!
//! Each socket object owns one [`EventLoop`]: a thread blocked in the
//! readiness poller that runs registered handlers and posted tasks. Handlers
//! are oneshot; they return the interest to re-arm with, or `None` to retire
//! the registration.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::poll::{Event, Events, Interest, Poller};
use crate::sync::Mutex;

/// Identifies one registration.
pub(crate) type Token = u64;

type Task = Box<dyn FnOnce() + Send>;
type Handler = Box<dyn FnMut(Readiness) -> Option<Interest> + Send>;
type Tick = Box<dyn FnMut() + Send>;

/// Upper bound on one blocking wait, so a missed wakeup cannot stall the loop.
const TICK: Duration = Duration::from_millis(50);
const EVENTS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
  pub token: Token,
  pub readable: bool,
  pub writable: bool,
}

struct Source {
  fd: RawFd,
  handler: Arc<Mutex<Handler>>,
}

struct Shared {
  poller: Poller,
  sources: Mutex<HashMap<Token, Source>>,
  next_token: AtomicU64,
  tasks_tx: Sender<Task>,
  tasks_rx: Receiver<Task>,
  tick: Mutex<Option<Tick>>,
  loop_thread: Mutex<Option<ThreadId>>,
}

struct Worker {
  running: Arc<AtomicBool>,
  thread: JoinHandle<()>,
  done: Receiver<()>,
}

pub(crate) struct EventLoop {
  shared: Arc<Shared>,
  worker: Mutex<Option<Worker>>,
}

impl EventLoop {
  pub fn new() -> io::Result<Self> {
    let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
    Ok(Self {
      shared: Arc::new(Shared {
        poller: Poller::new()?,
        sources: Mutex::new(HashMap::new()),
        next_token: AtomicU64::new(0),
        tasks_tx,
        tasks_rx,
        tick: Mutex::new(None),
        loop_thread: Mutex::new(None),
      }),
      worker: Mutex::new(None),
    })
  }

  /// Spawns the loop thread. Starting a running loop is a no-op.
  pub fn start(&self, name: &str) -> io::Result<()> {
    let mut worker = self.worker.lock();
    if worker.is_some() {
      return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let (done_tx, done) = crossbeam_channel::bounded(1);
    let thread = {
      let shared = Arc::clone(&self.shared);
      let running = Arc::clone(&running);
      thread::Builder::new().name(name.to_owned()).spawn(move || {
        *shared.loop_thread.lock() = Some(thread::current().id());
        tracing::trace!("event loop started");
        shared.run(&running);
        tracing::trace!("event loop exited");
        let _ = done_tx.send(());
      })?
    };

    *worker = Some(Worker { running, thread, done });
    Ok(())
  }

  pub fn is_running(&self) -> bool {
    self.worker.lock().is_some()
  }

  pub fn is_loop_thread(&self) -> bool {
    *self.shared.loop_thread.lock() == Some(thread::current().id())
  }

  /// Stops the loop thread and drops every registration and queued task.
  ///
  /// Waits at most `wait` for the thread to finish. Called from the loop
  /// thread itself it does not wait at all; the loop exits once the current
  /// handler returns. Returns false if the thread did not finish in time, in
  /// which case it is left detached.
  pub fn stop(&self, wait: Duration) -> bool {
    let Some(worker) = self.worker.lock().take() else {
      self.reset();
      return true;
    };

    worker.running.store(false, Ordering::Release);
    if let Err(err) = self.shared.poller.notify() {
      tracing::warn!(%err, "failed to wake event loop");
    }

    if self.is_loop_thread() {
      self.reset();
      return true;
    }

    match worker.done.recv_timeout(wait) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => {
        let _ = worker.thread.join();
        self.reset();
        true
      }
      Err(RecvTimeoutError::Timeout) => {
        tracing::warn!(?wait, "event loop did not stop in time, detaching");
        false
      }
    }
  }

  fn reset(&self) {
    let sources: Vec<Source> =
      self.shared.sources.lock().drain().map(|(_, source)| source).collect();
    for source in &sources {
      let _ = self.shared.poller.delete(source.fd);
    }
    // Handlers own stream references; drop them outside the lock.
    drop(sources);

    let discarded = self.shared.tasks_rx.try_iter().count();
    if discarded > 0 {
      tracing::debug!(discarded, "dropped queued event loop tasks");
    }
  }

  /// Queues `task` to run on the loop thread. Returns false if the loop is
  /// not running.
  pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
    if !self.is_running() {
      return false;
    }
    if self.shared.tasks_tx.send(Box::new(task)).is_err() {
      return false;
    }
    if let Err(err) = self.shared.poller.notify() {
      tracing::warn!(%err, "failed to wake event loop");
    }
    true
  }

  /// Installs `tick`, replacing any earlier one. It runs on the loop thread
  /// after every wakeup, so at least every 50 ms.
  pub fn on_tick(&self, tick: impl FnMut() + Send + 'static) {
    *self.shared.tick.lock() = Some(Box::new(tick));
  }

  /// Registers `fd` with a handler that runs on the loop thread whenever the
  /// requested readiness fires.
  pub fn register(
    &self,
    fd: RawFd,
    interest: Interest,
    handler: impl FnMut(Readiness) -> Option<Interest> + Send + 'static,
  ) -> io::Result<Token> {
    let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
    let handler: Handler = Box::new(handler);

    let mut sources = self.shared.sources.lock();
    sources.insert(token, Source { fd, handler: Arc::new(Mutex::new(handler)) });
    if let Err(err) = self.shared.poller.add(fd, token, interest) {
      sources.remove(&token);
      return Err(err);
    }
    Ok(token)
  }

  /// Re-arms a registration from outside its handler. Returns false if the
  /// registration no longer exists.
  pub fn rearm(&self, token: Token, interest: Interest) -> bool {
    let sources = self.shared.sources.lock();
    let Some(source) = sources.get(&token) else {
      return false;
    };
    match self.shared.poller.modify(source.fd, token, interest) {
      Ok(()) => true,
      Err(err) => {
        tracing::warn!(%err, token, "failed to re-arm registration");
        false
      }
    }
  }

  /// Removes a registration. Must happen before its fd is closed.
  pub fn deregister(&self, token: Token) -> bool {
    let source = {
      let mut sources = self.shared.sources.lock();
      let Some(source) = sources.remove(&token) else {
        return false;
      };
      if let Err(err) = self.shared.poller.delete(source.fd) {
        tracing::warn!(%err, token, "failed to remove registration");
      }
      source
    };
    drop(source);
    true
  }
}

impl Drop for EventLoop {
  fn drop(&mut self) {
    // Let a still-running thread wind down on its own.
    if let Some(worker) = self.worker.lock().take() {
      worker.running.store(false, Ordering::Release);
      let _ = self.shared.poller.notify();
    }
  }
}

impl Shared {
  fn run(&self, running: &AtomicBool) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    while running.load(Ordering::Acquire) {
      if let Err(err) = self.poller.wait(&mut events, Some(TICK)) {
        if err.kind() == io::ErrorKind::Interrupted {
          continue;
        }
        tracing::error!(%err, "poller wait failed, stopping event loop");
        break;
      }

      for event in events.iter() {
        if !running.load(Ordering::Acquire) {
          return;
        }
        self.dispatch(event);
      }

      while running.load(Ordering::Acquire) {
        match self.tasks_rx.try_recv() {
          Ok(task) => task(),
          Err(_) => break,
        }
      }

      if let Some(tick) = self.tick.lock().as_mut() {
        tick();
      }
    }
  }

  fn dispatch(&self, event: Event) {
    let handler = match self.sources.lock().get(&event.key) {
      Some(source) => Arc::clone(&source.handler),
      None => return,
    };

    let next = {
      let mut guard = handler.lock();
      let handler: &mut Handler = &mut guard;
      handler(Readiness {
        token: event.key,
        readable: event.readable,
        writable: event.writable,
      })
    };

    // The handler may have deregistered itself or been removed from another
    // thread meanwhile; only touch registrations that still exist.
    let mut sources = self.sources.lock();
    match next {
      Some(interest) => {
        if let Some(source) = sources.get(&event.key) {
          if let Err(err) = self.poller.modify(source.fd, event.key, interest) {
            tracing::warn!(%err, token = event.key, "failed to re-arm registration");
          }
        }
      }
      None => {
        if let Some(source) = sources.remove(&event.key) {
          let _ = self.poller.delete(source.fd);
          drop(sources);
          drop(source);
        }
      }
    }
  }
}

/// Serializes work on one connection across threads.
pub(crate) struct Strand {
  lock: Mutex<()>,
}

impl Strand {
  pub fn new() -> Self {
    Self { lock: Mutex::new(()) }
  }

  pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
    let _guard = self.lock.lock();
    f()
  }

  /// Runs `f` only if nobody else is inside the strand.
  pub fn try_run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
    let _guard = self.lock.try_lock()?;
    Some(f())
  }
}
