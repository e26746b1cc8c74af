//! Platform-specific readiness multiplexer.
//!
//! This module provides a unified interface over the OS readiness
//! mechanisms the engine runs on (`epoll` on Linux, `kqueue` on macOS).
//!
//! The poller is used by the event loop to:
//! - track per-socket interest masks,
//! - block waiting for readiness, bounded by the nearest timer deadline,
//! - wake up when another thread queues work for the loop.
//!
//! The concrete implementation is selected at compile time depending on
//! the target operating system.

pub(crate) mod common;
pub(crate) mod unix;

pub(crate) use common::{Interest, Waker};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) type Poller = epoll::EpollPoller;

#[cfg(target_os = "macos")]
pub(crate) type Poller = kqueue::KqueuePoller;
