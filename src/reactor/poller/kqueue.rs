//! macOS `kqueue`-based poller implementation.
//!
//! Functionally equivalent to the Linux `epoll` poller and exposes the
//! same interface to the event loop. Interest masks map to the
//! `EVFILT_READ`/`EVFILT_WRITE` filters; the wake-up signal is a
//! non-blocking pipe, since macOS has no `eventfd`.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;
use crate::reactor::poller::unix::{sys_close, sys_set_nonblocking};

use libc::{
    EV_ADD, EV_DELETE, EV_ENABLE, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec,
};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::Arc;

/// Reserved token used internally for the wake-up pipe.
const WAKE_TOKEN: usize = usize::MAX;

pub(crate) struct KqueuePoller {
    /// Kqueue file descriptor.
    kq: RawFd,

    /// Reusable buffer for kevents.
    events: Vec<kevent>,

    /// Read end of the wake-up pipe, registered with the kqueue.
    wake_read: RawFd,

    /// Waker wrapping the write end of the wake-up pipe.
    waker: Arc<Waker>,
}

unsafe impl Send for KqueuePoller {}

impl Waker {
    /// Wake the poller by writing a byte into the wake-up pipe.
    pub(crate) fn wake(&self) {
        let buf = [1u8];
        unsafe {
            libc::write(self.0, buf.as_ptr() as *const _, 1);
        }
    }
}

impl KqueuePoller {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys_close(kq);
            return Err(err);
        }

        let (wake_read, wake_write) = (fds[0], fds[1]);
        for fd in [wake_read, wake_write] {
            if let Err(err) = sys_set_nonblocking(fd) {
                sys_close(wake_read);
                sys_close(wake_write);
                sys_close(kq);
                return Err(err);
            }
        }

        let poller = Self {
            kq,
            events: Vec::with_capacity(64),
            wake_read,
            waker: Arc::new(Waker(wake_write)),
        };

        poller.apply(wake_read, WAKE_TOKEN, Interest::READ);

        Ok(poller)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) {
        self.apply(fd, token, interest);
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) {
        self.apply(fd, token, interest);
    }

    pub(crate) fn deregister(&self, fd: RawFd) {
        self.apply(
            fd,
            0,
            Interest {
                read: false,
                write: false,
            },
        );
    }

    /// Submit filter changes for both directions in one `kevent` call.
    ///
    /// A receipt buffer absorbs per-change errors so that deleting a
    /// filter that was never added (ENOENT) stays silent, matching the
    /// mod-or-add semantics of the epoll backend.
    fn apply(&self, fd: RawFd, token: usize, interest: Interest) {
        let changes = [
            change(fd, EVFILT_READ, token, interest.read),
            change(fd, EVFILT_WRITE, token, interest.write),
        ];
        let mut receipts = [unsafe { std::mem::zeroed::<kevent>() }; 2];

        unsafe {
            kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                receipts.as_mut_ptr(),
                receipts.len() as i32,
                ptr::null(),
            );
        }
    }

    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout_ms: Option<u64>) -> io::Result<()> {
        let ts = timeout_ms.map(|ms| timespec {
            tv_sec: (ms / 1000) as _,
            tv_nsec: ((ms % 1000) * 1_000_000) as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const timespec)
            .unwrap_or(ptr::null());

        unsafe {
            self.events.set_len(self.events.capacity());
        }

        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                ts_ptr,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                self.events.set_len(0);
            }
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        events.clear();

        for ev in &self.events {
            if ev.flags & EV_ERROR != 0 {
                continue;
            }

            let token = ev.udata as usize;

            // Wake-up event
            if token == WAKE_TOKEN {
                let mut buf = [0u8; 64];
                unsafe {
                    libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len());
                }
                continue;
            }

            let readable = ev.filter == EVFILT_READ;
            let writable = ev.filter == EVFILT_WRITE;

            if let Some(e) = events.iter_mut().find(|e| e.token == token) {
                e.readable |= readable;
                e.writable |= writable;
            } else {
                events.push(Event {
                    token,
                    readable,
                    writable,
                });
            }
        }

        Ok(())
    }
}

fn change(fd: RawFd, filter: i16, token: usize, enable: bool) -> kevent {
    kevent {
        ident: fd as usize,
        filter,
        flags: if enable { EV_ADD | EV_ENABLE } else { EV_DELETE },
        fflags: 0,
        data: 0,
        udata: token as *mut _,
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        sys_close(self.waker.0);
        sys_close(self.wake_read);
        sys_close(self.kq);
    }
}
