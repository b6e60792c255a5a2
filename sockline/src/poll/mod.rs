//! OS readiness polling.
//!
//! Uses kqueue on BSD/macOS and epoll on Linux. Every registration is
//! oneshot: after an event fires the fd stays registered but disarmed until
//! it is modified again.

mod notifier;
mod os;

#[cfg(linux)]
use os::epoll as sys;

#[cfg(kqueue)]
use os::kqueue as sys;


use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) use notifier::NOTIFY_KEY;

/// Interest flags for event registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
  Read,
  Write,
  ReadWrite,
}

impl Interest {
  pub fn is_readable(&self) -> bool {
    matches!(self, Self::Read | Self::ReadWrite)
  }

  pub fn is_writable(&self) -> bool {
    matches!(self, Self::Write | Self::ReadWrite)
  }

  /// Read interest, plus write interest when `write` is set.
  pub fn read_and(write: bool) -> Self {
    if write { Self::ReadWrite } else { Self::Read }
  }
}

/// OS-specific readiness polling.
///
/// - **epoll**: read and write interest live on a single registration
/// - **kqueue**: read and write are separate filters
pub trait ReadinessPoll {
  type NativeEvent;

  /// Add interest for a file descriptor. Fails if `fd` is already added.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Re-arm an added file descriptor with new interest.
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Remove all interest for a file descriptor.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Wait for events, filling the provided buffer. Returns the count.
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize>;

  /// Wake up a blocked `wait`.
  fn notify(&self) -> io::Result<()>;

  /// Reset the wakeup source after a notification was observed.
  fn drain_notifications(&self);

  fn event_key(event: &Self::NativeEvent) -> u64;

  /// kqueue reports one direction per event, epoll may report both.
  fn event_interest(event: &Self::NativeEvent) -> Interest;
}

/// Check if an error is "not found" (ENOENT)
pub(crate) fn is_not_found_error(err: &io::Error) -> bool {
  err.raw_os_error() == Some(libc::ENOENT)
}

/// A readiness event for a registered source.
#[derive(Debug, Clone, Copy)]
pub struct Event {
  pub key: u64,
  pub readable: bool,
  pub writable: bool,
}

type NativeEvent = <sys::OsPoller as ReadinessPoll>::NativeEvent;

/// A reusable buffer of events returned from polling
pub struct Events {
  events: Vec<NativeEvent>,
  len: usize,
}

// SAFETY: the raw pointers in kevent's udata carry plain integer keys and are
// never dereferenced.
unsafe impl Send for Events {}

impl Events {
  pub fn with_capacity(capacity: usize) -> Self {
    Self { events: vec![unsafe { std::mem::zeroed() }; capacity.max(1)], len: 0 }
  }

  /// Iterates over received events, skipping internal wakeups.
  pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
    self.events[..self.len].iter().filter_map(|native| {
      let key = sys::OsPoller::event_key(native);
      if key == NOTIFY_KEY {
        return None;
      }
      let interest = sys::OsPoller::event_interest(native);
      Some(Event {
        key,
        readable: interest.is_readable(),
        writable: interest.is_writable(),
      })
    })
  }

  fn notified(&self) -> bool {
    self.events[..self.len]
      .iter()
      .any(|native| sys::OsPoller::event_key(native) == NOTIFY_KEY)
  }
}

/// Main polling structure
pub struct Poller {
  inner: sys::OsPoller,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    Ok(Self { inner: sys::OsPoller::new()? })
  }

  pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if fd < 0 {
      return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    assert_ne!(key, NOTIFY_KEY, "Poller::add: key is reserved");
    self.inner.add(fd, key, interest)
  }

  pub fn modify(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    if fd < 0 {
      return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    self.inner.modify(fd, key, interest)
  }

  /// Remove interest for a file descriptor. Missing registrations are not an
  /// error.
  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    match self.inner.delete(fd) {
      Err(err) if !is_not_found_error(&err) => Err(err),
      _ => Ok(()),
    }
  }

  /// Waits for events, reusing the buffer in `events`.
  pub fn wait(
    &self,
    events: &mut Events,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    events.len = 0;
    let n = self.inner.wait(&mut events.events, timeout)?;
    assert!(n <= events.events.len(), "wait returned more events than buffer");
    events.len = n;

    if events.notified() {
      self.inner.drain_notifications();
    }
    Ok(())
  }

  pub fn notify(&self) -> io::Result<()> {
    self.inner.notify()
  }
}
