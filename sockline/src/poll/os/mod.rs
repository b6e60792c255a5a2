#[cfg(linux)]
pub mod epoll;

#[cfg(kqueue)]
pub mod kqueue;
