use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use tracing::{debug, error, trace, warn};

use crate::net::buf::{InputBuf, OutputQueue};
use crate::net::socket::TcpSocket;
use crate::reactor::core::EventLoop;
use crate::reactor::event::Event;
use crate::reactor::handle::LoopHandle;
use crate::reactor::poller::Interest;
use crate::reactor::poller::unix::{sys_read, sys_write};

const DEFAULT_INPUT_CAPACITY: usize = 64 * 1024;
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-connection configuration, fixed at adoption time.
pub struct ConnOptions {
    pub(crate) name: String,
    pub(crate) input_capacity: usize,
    pub(crate) high_water_mark: usize,
}

impl ConnOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_capacity: DEFAULT_INPUT_CAPACITY,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Capacity of the input buffer in bytes.
    pub fn input_capacity(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "input capacity must be non-zero");
        self.input_capacity = bytes;
        self
    }

    /// Queued-byte threshold whose upward crossing fires the high-water
    /// callback.
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "high-water mark must be non-zero");
        self.high_water_mark = bytes;
        self
    }
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self::new("connection")
    }
}

type ConnectCallback = Box<dyn FnMut(&mut ConnCtx<'_>) + Send>;
type MessageCallback = Box<dyn FnMut(&mut ConnCtx<'_>, &mut InputBuf) + Send>;
type WriteCompleteCallback = Box<dyn FnMut(&mut ConnCtx<'_>) + Send>;
type HighWaterCallback = Box<dyn FnMut(&mut ConnCtx<'_>, usize) + Send>;
type CloseCallback = Box<dyn FnMut(&mut ConnCtx<'_>) + Send>;

/// The callback set of a connection, finalized before adoption.
///
/// Nothing here can be replaced once the connection is live, so callbacks
/// never race the loop that invokes them.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_write_complete: Option<WriteCompleteCallback>,
    pub(crate) on_high_water: Option<HighWaterCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked once when the connection is established, before any message
    /// delivery.
    pub fn on_connect(mut self, f: impl FnMut(&mut ConnCtx<'_>) + Send + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Invoked with the readable region after each read cycle. The callback
    /// may consume any prefix; the rest persists into the next delivery.
    pub fn on_message(
        mut self,
        f: impl FnMut(&mut ConnCtx<'_>, &mut InputBuf) + Send + 'static,
    ) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Invoked after the output queue fully drains, including after a send
    /// that was written in one piece.
    pub fn on_write_complete(mut self, f: impl FnMut(&mut ConnCtx<'_>) + Send + 'static) -> Self {
        self.on_write_complete = Some(Box::new(f));
        self
    }

    /// Invoked with the queued byte total when it crosses the high-water
    /// mark from below. Fires once per excursion; slowing down is the
    /// caller's job, the engine applies no throttling of its own.
    pub fn on_high_water(
        mut self,
        f: impl FnMut(&mut ConnCtx<'_>, usize) + Send + 'static,
    ) -> Self {
        self.on_high_water = Some(Box::new(f));
        self
    }

    /// Invoked once after the socket is closed, whatever caused it.
    pub fn on_close(mut self, f: impl FnMut(&mut ConnCtx<'_>) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ConnId {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl ConnId {
    const PLACEHOLDER: Self = Self {
        slot: usize::MAX,
        generation: 0,
    };
}

/// A connection owned by an event loop.
///
/// Split so callback invocation can borrow the pieces disjointly: `io` is
/// everything the in-callback context may touch, while the callbacks
/// themselves and the input buffer stay with the owner frame.
pub(crate) struct Connection {
    io: ConnIo,
    input: InputBuf,
    cbs: Callbacks,
}

pub(crate) struct ConnIo {
    id: ConnId,
    name: String,
    sock: TcpSocket,
    peer: Option<SocketAddr>,
    state: ConnState,
    reading: bool,
    writing: bool,
    registered: bool,
    output: OutputQueue,
    high_water_mark: usize,
    above_high_water: bool,
    close_emitted: bool,
}

impl Connection {
    pub(crate) fn new(sock: TcpSocket, options: ConnOptions, cbs: Callbacks) -> Self {
        let peer = sock.peer_addr().ok();

        Self {
            io: ConnIo {
                id: ConnId::PLACEHOLDER,
                name: options.name,
                sock,
                peer,
                state: ConnState::Connecting,
                reading: false,
                writing: false,
                registered: false,
                output: OutputQueue::new(),
                high_water_mark: options.high_water_mark,
                above_high_water: false,
                close_emitted: false,
            },
            input: InputBuf::with_capacity(options.input_capacity),
            cbs,
        }
    }

    pub(crate) fn set_id(&mut self, id: ConnId) {
        self.io.id = id;
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.io.state == ConnState::Disconnected
    }

    pub(crate) fn establish(&mut self, lp: &mut EventLoop) {
        assert!(
            self.io.state == ConnState::Connecting,
            "establishing a connection past its connecting state"
        );

        self.io.state = ConnState::Connected;
        self.io.reading = true;
        self.io.update_interest(lp);

        debug!(name = %self.io.name, peer = ?self.io.peer, "connection established");

        let Connection { io, cbs, .. } = self;
        if let Some(cb) = cbs.on_connect.as_mut() {
            cb(&mut ConnCtx { io, lp });
        }
    }

    pub(crate) fn handle_event(&mut self, event: Event, lp: &mut EventLoop) {
        if event.readable && self.io.state != ConnState::Disconnected {
            self.handle_read(lp);
        }

        if event.writable && self.io.state != ConnState::Disconnected {
            self.io.handle_write(lp);
        }
    }

    fn handle_read(&mut self, lp: &mut EventLoop) {
        if self.input.is_full() {
            // No room to read; redeliver what is buffered and let the
            // callback make space.
            self.deliver_message(lp);

            if self.io.state != ConnState::Disconnected && self.input.is_full() {
                // Nothing was consumed, so the next readiness event would
                // replay this exact state forever.
                error!(
                    name = %self.io.name,
                    capacity = self.input.capacity(),
                    "input buffer overflow, closing connection"
                );
                self.io.detach(lp);
            }
            return;
        }

        let n = sys_read(self.io.sock.fd(), self.input.spare_mut());

        if n > 0 {
            self.input.fill(n as usize);
            self.deliver_message(lp);
        } else if n == 0 {
            // Readable with nothing to read: orderly close from the peer.
            debug!(name = %self.io.name, "peer closed");
            self.io.detach(lp);
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!(name = %self.io.name, %err, "read failed, closing connection");
                self.io.detach(lp);
            }
        }
    }

    fn deliver_message(&mut self, lp: &mut EventLoop) {
        if self.input.is_empty() {
            return;
        }

        let Connection { io, input, cbs } = self;
        if let Some(cb) = cbs.on_message.as_mut() {
            cb(&mut ConnCtx { io, lp }, input);
        }
        input.compact();
    }

    pub(crate) fn emit_write_complete(&mut self, lp: &mut EventLoop) {
        let Connection { io, cbs, .. } = self;
        if let Some(cb) = cbs.on_write_complete.as_mut() {
            cb(&mut ConnCtx { io, lp });
        }
    }

    pub(crate) fn emit_high_water(&mut self, lp: &mut EventLoop, queued: usize) {
        warn!(name = %self.io.name, queued, "output queue crossed the high-water mark");

        let Connection { io, cbs, .. } = self;
        if let Some(cb) = cbs.on_high_water.as_mut() {
            cb(&mut ConnCtx { io, lp }, queued);
        }
    }

    /// Runs the close callback once the connection has detached. Safe to
    /// call repeatedly; only the first call emits.
    pub(crate) fn emit_close(&mut self, lp: &mut EventLoop) {
        debug_assert!(self.io.state == ConnState::Disconnected);

        if self.io.close_emitted {
            return;
        }
        self.io.close_emitted = true;

        debug!(name = %self.io.name, "connection closed");

        let Connection { io, cbs, .. } = self;
        if let Some(cb) = cbs.on_close.as_mut() {
            cb(&mut ConnCtx { io, lp });
        }
    }

    pub(crate) fn send_in_loop(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.io.send_in_loop(lp, data);
    }

    pub(crate) fn shutdown_in_loop(&mut self) {
        self.io.shutdown_in_loop();
    }

    pub(crate) fn set_reading(&mut self, lp: &mut EventLoop, on: bool) {
        self.io.set_reading(lp, on);
    }
}

impl ConnIo {
    fn interest(&self) -> Interest {
        Interest {
            read: self.reading,
            write: self.writing,
        }
    }

    fn update_interest(&mut self, lp: &mut EventLoop) {
        if self.state == ConnState::Disconnected {
            return;
        }

        if self.registered {
            lp.poller.reregister(self.sock.fd(), self.id.slot, self.interest());
        } else {
            lp.poller.register(self.sock.fd(), self.id.slot, self.interest());
            self.registered = true;
        }
    }

    /// Cancels all interest, closes the socket, and marks the connection
    /// disconnected. The close callback is emitted by the owning loop once
    /// the current step unwinds.
    fn detach(&mut self, lp: &mut EventLoop) {
        if self.state == ConnState::Disconnected {
            return;
        }

        self.state = ConnState::Disconnected;

        if self.registered {
            lp.poller.deregister(self.sock.fd());
            self.registered = false;
        }

        self.sock.close_now();
    }

    fn send_in_loop(&mut self, lp: &mut EventLoop, data: &[u8]) {
        if self.state != ConnState::Connected {
            warn!(
                name = %self.name,
                state = ?self.state,
                "dropping send on a connection that is not connected"
            );
            return;
        }

        let mut written = 0usize;

        // Fast path: nothing queued and no write interest, so the socket
        // may take the whole buffer right now.
        if !self.writing && self.output.is_empty() {
            let n = sys_write(self.sock.fd(), data);

            if n >= 0 {
                written = n as usize;
                if written == data.len() {
                    lp.defer_write_complete(self.id);
                    return;
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, %err, "write failed, closing connection");
                    self.detach(lp);
                    return;
                }
            }
        }

        let before = self.output.total_bytes();
        self.output.push(data[written..].to_vec());
        let after = self.output.total_bytes();

        // Strict upward crossing, latched until the queue drains back
        // below the mark: staying above it must not re-fire.
        if !self.above_high_water
            && before < self.high_water_mark
            && after >= self.high_water_mark
        {
            self.above_high_water = true;
            lp.defer_high_water(self.id, after);
        }

        if !self.writing {
            self.writing = true;
            self.update_interest(lp);
        }
    }

    fn handle_write(&mut self, lp: &mut EventLoop) {
        if !self.writing {
            trace!(name = %self.name, "write readiness without write interest");
            return;
        }

        loop {
            let (n, front_len) = {
                let Some(front) = self.output.front() else { break };
                (sys_write(self.sock.fd(), front), front.len())
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                error!(name = %self.name, %err, "write failed, closing connection");
                self.detach(lp);
                return;
            }

            let n = n as usize;
            self.output.advance(n);

            if n < front_len {
                // The socket took a partial buffer; the rest waits for the
                // next write readiness.
                break;
            }
        }

        if self.above_high_water && self.output.total_bytes() < self.high_water_mark {
            self.above_high_water = false;
        }

        if self.output.is_empty() {
            self.writing = false;
            self.update_interest(lp);
            lp.defer_write_complete(self.id);

            if self.state == ConnState::Disconnecting {
                if let Err(err) = self.sock.shutdown_write() {
                    warn!(name = %self.name, %err, "shutdown after drain failed");
                }
            }
        }
    }

    fn shutdown_in_loop(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }

        self.state = ConnState::Disconnecting;

        // With data still queued the write half stays open until the
        // drain completes; handle_write finishes the shutdown.
        if !self.writing {
            if let Err(err) = self.sock.shutdown_write() {
                warn!(name = %self.name, %err, "shutdown failed");
            }
        }
    }

    fn set_reading(&mut self, lp: &mut EventLoop, on: bool) {
        if self.state == ConnState::Disconnected || self.reading == on {
            return;
        }

        self.reading = on;
        self.update_interest(lp);
    }
}

/// In-loop face of a connection, handed to its callbacks.
///
/// Only the owning loop can construct one, which is what makes the
/// mutating operations here single-threaded by construction: off-thread
/// code never holds a `ConnCtx`, it holds a [`ConnHandle`].
pub struct ConnCtx<'a> {
    pub(crate) io: &'a mut ConnIo,
    pub(crate) lp: &'a mut EventLoop,
}

impl ConnCtx<'_> {
    pub fn name(&self) -> &str {
        &self.io.name
    }

    pub fn state(&self) -> ConnState {
        self.io.state
    }

    pub fn is_connected(&self) -> bool {
        self.io.state == ConnState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.io.peer
    }

    /// The underlying socket handle.
    pub fn fd(&self) -> RawFd {
        self.io.sock.fd()
    }

    /// Unwritten bytes currently queued for this connection.
    pub fn queued_bytes(&self) -> usize {
        self.io.output.total_bytes()
    }

    /// Sends `data`, writing immediately when the socket allows it and
    /// queueing the rest for write readiness.
    pub fn send(&mut self, data: &[u8]) {
        self.io.send_in_loop(self.lp, data);
    }

    /// Begins an orderly shutdown: queued data is flushed, then the write
    /// half closes. The connection ends when the peer closes its side.
    pub fn shutdown(&mut self) {
        self.io.shutdown_in_loop();
    }

    /// Closes immediately: all interest is cancelled and the socket is
    /// closed; the close callback runs when the current step unwinds.
    ///
    /// # Panics
    ///
    /// Panics when the connection is already disconnected.
    pub fn close(&mut self) {
        assert!(
            self.io.state != ConnState::Disconnected,
            "closing a disconnected connection"
        );
        self.io.detach(self.lp);
    }

    pub fn start_read(&mut self) {
        self.io.set_reading(self.lp, true);
    }

    pub fn stop_read(&mut self) {
        self.io.set_reading(self.lp, false);
    }

    /// A handle for reaching this connection from other threads.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            id: self.io.id,
            handle: self.lp.handle(),
        }
    }

    /// The loop that owns this connection, for scheduling timers and
    /// other loop-level work from inside a callback.
    pub fn event_loop(&mut self) -> &mut EventLoop {
        self.lp
    }
}

/// Thread-safe reference to a connection owned by some loop.
///
/// Operations are redirected through the owning loop's task queue and take
/// effect when that loop next drains it. A handle may outlive its
/// connection; operations on a gone connection are dropped silently.
#[derive(Clone)]
pub struct ConnHandle {
    pub(crate) id: ConnId,
    pub(crate) handle: LoopHandle,
}

impl ConnHandle {
    pub fn send(&self, data: Vec<u8>) {
        let id = self.id;
        self.handle
            .run_later(move |lp| lp.with_conn(id, move |conn, lp| conn.send_in_loop(lp, &data)));
    }

    pub fn shutdown(&self) {
        let id = self.id;
        self.handle
            .run_later(move |lp| lp.with_conn(id, |conn, _| conn.shutdown_in_loop()));
    }

    pub fn start_read(&self) {
        let id = self.id;
        self.handle
            .run_later(move |lp| lp.with_conn(id, |conn, lp| conn.set_reading(lp, true)));
    }

    pub fn stop_read(&self) {
        let id = self.id;
        self.handle
            .run_later(move |lp| lp.with_conn(id, |conn, lp| conn.set_reading(lp, false)));
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }
}
