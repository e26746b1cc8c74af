use std::net::SocketAddr;
use std::os::fd::RawFd;

use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::net::socket::TcpSocket;
use crate::reactor::poller::unix::{
    accept_error_is_transient, socketaddr_to_storage, sys_accept, sys_bind, sys_listen,
    sys_set_reuseaddr, sys_socket, sys_sockname,
};

/// A listening socket, bound and listening from construction.
///
/// Hand it to [`EventLoop::start_accept`](crate::EventLoop::start_accept)
/// to register accept interest; the loop owns it from then on.
pub struct Acceptor {
    sock: TcpSocket,
    local: SocketAddr,
}

impl Acceptor {
    /// Binds and listens on `address` (e.g. `"127.0.0.1:9000"`; port 0
    /// picks an ephemeral port, see [`local_addr`](Self::local_addr)).
    pub fn bind(address: &str) -> Result<Self> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        let (storage, len) = socketaddr_to_storage(&addr);

        let sock = TcpSocket::from_raw(sys_socket(storage.ss_family as _)?);
        sys_set_reuseaddr(sock.fd())?;
        sys_bind(sock.fd(), &storage, len)?;
        sys_listen(sock.fd())?;

        let local = sys_sockname(sock.fd())?;

        Ok(Self { sock, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.fd()
    }

    /// Accepts a single pending connection and configures it for the data
    /// path: non-blocking, `TCP_NODELAY`.
    ///
    /// Transient failures (drained backlog, descriptor exhaustion) leave
    /// the listener running and return `None`.
    pub(crate) fn handle_accept(&mut self) -> Option<(TcpSocket, SocketAddr)> {
        match sys_accept(self.sock.fd()) {
            Ok((fd, peer)) => {
                let sock = TcpSocket::from_raw(fd);
                if let Err(err) = sock.set_nodelay() {
                    warn!(%peer, %err, "failed to set TCP_NODELAY on accepted socket");
                }
                Some((sock, peer))
            }
            Err(err) if accept_error_is_transient(&err) => {
                warn!(local = %self.local, %err, "accept deferred");
                None
            }
            Err(err) => {
                error!(local = %self.local, %err, "accept failed");
                None
            }
        }
    }
}
