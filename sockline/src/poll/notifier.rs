//! Wakes a thread blocked in the readiness poller.
//!
//! - kqueue: EVFILT_USER, no file descriptor needed
//! - epoll: a non-blocking pipe whose read end is registered with the poller

use std::io;
#[cfg(not(kqueue))]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Key reserved for notification events. Never handed out as a source token.
pub const NOTIFY_KEY: u64 = u64::MAX;

#[cfg(kqueue)]
pub struct Notifier {
  _marker: std::marker::PhantomData<()>,
}

#[cfg(not(kqueue))]
pub struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

#[cfg(kqueue)]
impl Notifier {
  pub fn new() -> io::Result<Self> {
    Ok(Self { _marker: std::marker::PhantomData })
  }

  /// Triggering happens through the kqueue itself.
  pub fn notify(&self) -> io::Result<()> {
    Ok(())
  }

  /// EV_CLEAR resets the user event, nothing to drain.
  pub fn drain(&self) {}
}

#[cfg(not(kqueue))]
impl Notifier {
  pub fn new() -> io::Result<Self> {
    let mut fds = [0i32; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
  }

  pub fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  pub fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      // A full pipe already guarantees a pending wakeup.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Empties the pipe so the level-triggered registration stops firing.
  pub fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      let res = syscall!(read(
        self.read_fd.as_raw_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      ));
      match res {
        Ok(n) if n > 0 => continue,
        _ => break,
      }
    }
  }
}
