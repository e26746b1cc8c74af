use std::net::SocketAddr;
use std::os::fd::RawFd;

use tracing::warn;

use crate::error::{Error, Result};
use crate::net::socket::TcpSocket;
use crate::reactor::poller::unix::{socketaddr_to_storage, sys_socket};

/// An outbound connection attempt.
///
/// One connector produces at most one connection; hand it to
/// [`EventLoop::start_connect`](crate::EventLoop::start_connect), which
/// performs the single non-blocking connect. There is no retry: a failed
/// attempt is logged and the connect callback never fires. Callers that
/// want retry build it above, by issuing a fresh connector from a timer.
pub struct Connector {
    sock: TcpSocket,
    target: SocketAddr,
}

impl Connector {
    pub fn new(address: &str) -> Result<Self> {
        let target: SocketAddr = address
            .parse()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        let (storage, _) = socketaddr_to_storage(&target);

        let sock = TcpSocket::from_raw(sys_socket(storage.ss_family as _)?);
        if let Err(err) = sock.set_nodelay() {
            warn!(addr = %target, %err, "failed to set TCP_NODELAY on connecting socket");
        }

        Ok(Self { sock, target })
    }

    pub fn target(&self) -> &SocketAddr {
        &self.target
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.fd()
    }

    pub(crate) fn into_socket(self) -> TcpSocket {
        self.sock
    }
}
