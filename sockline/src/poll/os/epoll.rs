use super::super::notifier::{NOTIFY_KEY, Notifier};
use super::super::{Interest, ReadinessPoll};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Wrapper around an epoll file descriptor
pub struct OsPoller {
  epoll_fd: OwnedFd,
  notifier: Notifier,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let epoll = Self { epoll_fd, notifier: Notifier::new()? };

    // Level-triggered on purpose: the loop drains the pipe after each wakeup.
    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      epoll.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      epoll.notifier.read_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(epoll)
  }

  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut events = libc::EPOLLONESHOT as u32;
    if interest.is_readable() {
      events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      op,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = match timeout {
      Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
      None => -1,
    };

    let n = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    ))?;

    Ok(n as usize)
  }

  fn notify(&self) -> io::Result<()> {
    self.notifier.notify()
  }

  fn drain_notifications(&self) {
    self.notifier.drain()
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let readable = (event.events & libc::EPOLLIN as u32) != 0;
    let writable = (event.events & libc::EPOLLOUT as u32) != 0;

    match (readable, writable) {
      (true, true) => Interest::ReadWrite,
      (true, false) => Interest::Read,
      (false, true) => Interest::Write,
      // EPOLLERR/EPOLLHUP alone: let both directions observe the failure.
      (false, false) => Interest::ReadWrite,
    }
  }
}
