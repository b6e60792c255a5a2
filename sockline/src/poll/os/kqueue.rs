use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

use super::super::notifier::{NOTIFY_KEY, Notifier};
use super::super::{Interest, ReadinessPoll, is_not_found_error};
use crate::sync::Mutex;

const NOTIFY_IDENT: usize = NOTIFY_KEY as usize;

/// Wrapper around a kqueue file descriptor
pub struct OsPoller {
  kq_fd: OwnedFd,
  /// Tracks registered fds so add/modify fail the way epoll does.
  registered_fds: Mutex<HashSet<RawFd>>,
  notifier: Notifier,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let kqueue = Self {
      kq_fd: unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) },
      registered_fds: Mutex::new(HashSet::new()),
      notifier: Notifier::new()?,
    };

    let kev = libc::kevent {
      ident: NOTIFY_IDENT as libc::uintptr_t,
      filter: libc::EVFILT_USER,
      flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
      fflags: 0,
      data: 0,
      udata: NOTIFY_IDENT as *mut libc::c_void,
    };
    kqueue.submit(&[kev])?;

    Ok(kqueue)
  }

  fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
    syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as i32,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    Ok(())
  }

  /// Read and write are separate filters; both go out in one kevent call.
  fn change_interests(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let filter = |filter| libc::kevent {
      ident: fd as libc::uintptr_t,
      filter,
      flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT,
      fflags: 0,
      data: 0,
      udata: key as usize as *mut libc::c_void,
    };

    let mut changes = Vec::with_capacity(2);
    if interest.is_readable() {
      changes.push(filter(libc::EVFILT_READ));
    }
    if interest.is_writable() {
      changes.push(filter(libc::EVFILT_WRITE));
    }
    self.submit(&changes)
  }

  fn delete_filter(&self, fd: RawFd, filter: i16) -> io::Result<()> {
    let kev = libc::kevent {
      ident: fd as libc::uintptr_t,
      filter,
      flags: libc::EV_DELETE,
      fflags: 0,
      data: 0,
      udata: ptr::null_mut(),
    };

    match self.submit(&[kev]) {
      Err(err) if !is_not_found_error(&err) => Err(err),
      _ => Ok(()),
    }
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if !self.registered_fds.lock().insert(fd) {
      return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    self.change_interests(fd, key, interest).inspect_err(|_| {
      self.registered_fds.lock().remove(&fd);
    })
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    if !self.registered_fds.lock().contains(&fd) {
      return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    // Oneshot filters that did not fire are still armed; drop the one that is
    // no longer wanted.
    if !interest.is_readable() {
      self.delete_filter(fd, libc::EVFILT_READ)?;
    }
    if !interest.is_writable() {
      self.delete_filter(fd, libc::EVFILT_WRITE)?;
    }
    self.change_interests(fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    if !self.registered_fds.lock().remove(&fd) {
      return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    self.delete_filter(fd, libc::EVFILT_READ)?;
    self.delete_filter(fd, libc::EVFILT_WRITE)
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout = timeout.map(|d| libc::timespec {
      tv_sec: d.as_secs() as libc::time_t,
      tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let timeout_ptr =
      timeout.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

    let n = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ptr,
    ))?;

    Ok(n as usize)
  }

  fn notify(&self) -> io::Result<()> {
    let kev = libc::kevent {
      ident: NOTIFY_IDENT as libc::uintptr_t,
      filter: libc::EVFILT_USER,
      flags: 0,
      fflags: libc::NOTE_TRIGGER,
      data: 0,
      udata: NOTIFY_IDENT as *mut libc::c_void,
    };
    self.submit(&[kev])
  }

  fn drain_notifications(&self) {
    self.notifier.drain()
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as usize as u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    match event.filter {
      libc::EVFILT_WRITE => Interest::Write,
      _ => Interest::Read,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  crate::generate_poller_tests!(OsPoller::new().unwrap());
}
