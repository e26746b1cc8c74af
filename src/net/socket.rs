use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::reactor::poller::unix::{
    sys_close, sys_peername, sys_set_nodelay, sys_shutdown_write, sys_sockname, sys_take_error,
};

/// An owned non-blocking TCP socket, as produced by an acceptor or a
/// completed connector. Closed on drop unless explicitly closed earlier.
pub struct TcpSocket {
    fd: RawFd,
}

impl TcpSocket {
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys_sockname(self.fd)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys_peername(self.fd)
    }

    pub(crate) fn set_nodelay(&self) -> io::Result<()> {
        sys_set_nodelay(self.fd)
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        sys_take_error(self.fd)
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        sys_shutdown_write(self.fd)
    }

    /// Closes the descriptor now. Subsequent calls and the eventual drop
    /// are no-ops.
    pub(crate) fn close_now(&mut self) {
        if self.fd >= 0 {
            sys_close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close_now();
    }
}
