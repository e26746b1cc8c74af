mod error;
mod net;
mod pool;
mod reactor;
mod utils;

pub use error::{Error, Result};
pub use net::acceptor::Acceptor;
pub use net::buf::InputBuf;
pub use net::conn::{Callbacks, ConnCtx, ConnHandle, ConnOptions, ConnState};
pub use net::connector::Connector;
pub use net::socket::TcpSocket;
pub use pool::Pool;
pub use reactor::core::EventLoop;
pub use reactor::handle::LoopHandle;
pub use reactor::timer::TimerId;
