use std::marker::PhantomData;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::Result;
use crate::net::acceptor::Acceptor;
use crate::net::conn::{Callbacks, ConnHandle, ConnId, ConnOptions, Connection};
use crate::net::connector::Connector;
use crate::net::socket::TcpSocket;
use crate::reactor::event::Event;
use crate::reactor::handle::{LoopHandle, LoopShared, Pending};
use crate::reactor::poller::{Interest, Poller, unix};
use crate::reactor::timer::{TimerHeap, TimerId};
use crate::utils::Slab;

type AcceptCallback = Box<dyn FnMut(&mut EventLoop, TcpSocket, SocketAddr)>;
type ConnectCallback = Box<dyn FnOnce(&mut EventLoop, TcpSocket)>;

/// A callback deferred until the current dispatch batch completes. These
/// are loop-local: queueing one never needs a wakeup.
type LocalTask = Box<dyn FnOnce(&mut EventLoop)>;

pub(crate) enum Entry {
    Acceptor {
        acceptor: Acceptor,
        on_accept: AcceptCallback,
    },
    Connector {
        connector: Connector,
        on_connect: ConnectCallback,
    },
    Conn(Connection),
}

/// A single-threaded event loop: readiness multiplexing, timers, and a
/// cross-thread task queue.
///
/// The loop is `!Send`; everything it owns is mutated only on the thread
/// that constructed it. Other threads interact exclusively through
/// [`LoopHandle`] and the id-carrying [`ConnHandle`], both of which funnel
/// into the task queue.
pub struct EventLoop {
    channels: Slab<Entry>,
    pub(crate) poller: Poller,
    timers: TimerHeap,
    shared: Arc<LoopShared>,
    events: Vec<Event>,
    deferred: Vec<LocalTask>,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Creates a loop owned by the calling thread.
    pub fn new() -> Result<Self> {
        let poller = Poller::new()?;
        let waker = poller.waker();

        let shared = Arc::new(LoopShared {
            pending: Mutex::new(Pending::default()),
            owner: thread::current().id(),
            live: AtomicBool::new(true),
            waker,
        });

        Ok(Self {
            channels: Slab::with_capacity(64),
            poller,
            timers: TimerHeap::new(),
            shared,
            events: Vec::with_capacity(64),
            deferred: Vec::new(),
            _not_send: PhantomData,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn assert_in_loop(&self) {
        assert!(
            self.is_in_loop(),
            "operation invoked off the owning loop thread"
        );
    }

    /// Asks the loop to exit after the current cycle.
    pub fn stop(&mut self) {
        self.shared.live.store(false, Ordering::Release);
    }

    /// Runs the loop until stopped.
    ///
    /// Each cycle blocks in the poller up to the nearest timer deadline or
    /// until woken, dispatches readiness, fires due timers, then runs a
    /// snapshot of the cross-thread task queue. A poller failure is fatal
    /// to the loop: no further readiness can be observed.
    pub fn run(&mut self) -> Result<()> {
        self.assert_in_loop();

        while self.shared.live.load(Ordering::Acquire) {
            let timeout = self.timers.next_timeout_ms(Instant::now());

            let mut events = mem::take(&mut self.events);
            let polled = self.poller.poll(&mut events, timeout);

            for event in events.drain(..) {
                self.dispatch(event);
            }
            self.events = events;
            polled?;

            self.run_deferred();
            self.fire_due(Instant::now());
            self.drain_tasks();

            self.channels.reclaim();
        }

        Ok(())
    }

    /// Schedules a one-shot callback after `delay`. Zero fires on the next
    /// cycle.
    pub fn schedule_after(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) -> TimerId {
        self.timers
            .insert(Instant::now() + delay, Duration::ZERO, Box::new(callback))
    }

    /// Schedules a repeating callback. Each run re-arms at fire time plus
    /// `interval`, so a loop that falls behind drifts instead of bursting.
    pub fn schedule_every(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + 'static,
    ) -> TimerId {
        self.timers
            .insert(Instant::now() + interval, interval, Box::new(callback))
    }

    /// Cancels a timer. Unknown and already-fired ids are no-ops.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Registers the acceptor for accept readiness and owns it from then
    /// on. `on_accept` receives each accepted socket, configured
    /// non-blocking with `TCP_NODELAY`.
    pub fn start_accept(
        &mut self,
        acceptor: Acceptor,
        on_accept: impl FnMut(&mut EventLoop, TcpSocket, SocketAddr) + 'static,
    ) {
        self.assert_in_loop();

        let fd = acceptor.fd();
        debug!(local = %acceptor.local_addr(), "accepting connections");

        let (slot, _generation) = self.channels.insert(Entry::Acceptor {
            acceptor,
            on_accept: Box::new(on_accept),
        });
        self.poller.register(fd, slot, Interest::READ);
    }

    /// Starts the connector's single non-blocking connect attempt.
    ///
    /// `on_connect` receives the connected socket once completion is
    /// verified; a failed connect is logged and never invokes it.
    pub fn start_connect(
        &mut self,
        connector: Connector,
        on_connect: impl FnOnce(&mut EventLoop, TcpSocket) + 'static,
    ) {
        self.assert_in_loop();

        match unix::sys_connect(connector.fd(), connector.target()) {
            Ok(()) => {
                debug!(addr = %connector.target(), "connect completed immediately");
                let sock = connector.into_socket();
                self.defer(move |lp| on_connect(lp, sock));
            }
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                let fd = connector.fd();
                let (slot, _generation) = self.channels.insert(Entry::Connector {
                    connector,
                    on_connect: Box::new(on_connect),
                });
                self.poller.register(fd, slot, Interest::WRITE);
            }
            Err(err) => {
                error!(addr = %connector.target(), %err, "connect failed");
            }
        }
    }

    /// Adopts a socket as a connection owned by this loop and establishes
    /// it: read interest is registered and the connect callback fires
    /// before any message delivery.
    pub fn adopt(
        &mut self,
        socket: TcpSocket,
        options: ConnOptions,
        callbacks: Callbacks,
    ) -> ConnHandle {
        self.assert_in_loop();

        let conn = Connection::new(socket, options, callbacks);
        let (slot, generation) = self.channels.insert(Entry::Conn(conn));
        let id = ConnId { slot, generation };

        if let Some(Entry::Conn(conn)) = self.channels.get_mut(slot, generation) {
            conn.set_id(id);
        }

        self.with_conn(id, |conn, lp| conn.establish(lp));

        ConnHandle {
            id,
            handle: self.handle(),
        }
    }

    /// Runs `f` against a connection by id, then finishes the step:
    /// a connection left disconnected is released after its close callback.
    /// Ids whose connection is gone are silently skipped; cross-thread
    /// operations race teardown legitimately.
    pub(crate) fn with_conn(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut Connection, &mut EventLoop),
    ) {
        let Some(entry) = self.channels.take_checked(id.slot, id.generation) else {
            trace!(?id, "connection is gone, dropping operation");
            return;
        };

        match entry {
            Entry::Conn(mut conn) => {
                f(&mut conn, self);
                self.finish_conn_step(id.slot, conn);
            }
            other => {
                self.channels.put_back(id.slot, other);
                unreachable!("connection id resolved to a non-connection entry");
            }
        }
    }

    pub(crate) fn defer(&mut self, f: impl FnOnce(&mut EventLoop) + 'static) {
        self.deferred.push(Box::new(f));
    }

    pub(crate) fn defer_write_complete(&mut self, id: ConnId) {
        self.defer(move |lp| lp.with_conn(id, |conn, lp| conn.emit_write_complete(lp)));
    }

    pub(crate) fn defer_high_water(&mut self, id: ConnId, queued: usize) {
        self.defer(move |lp| lp.with_conn(id, |conn, lp| conn.emit_high_water(lp, queued)));
    }

    fn dispatch(&mut self, event: Event) {
        // The entry may be gone: an earlier event in this batch tore it
        // down. Its slot stays quarantined until the batch ends, so the
        // token cannot alias a newly inserted entry.
        let Some(entry) = self.channels.take(event.token) else {
            return;
        };

        match entry {
            Entry::Acceptor {
                mut acceptor,
                mut on_accept,
            } => {
                if event.readable {
                    // One accept per readiness event. The poller is
                    // level-triggered, so remaining pending connections
                    // re-arm it immediately.
                    if let Some((sock, peer)) = acceptor.handle_accept() {
                        on_accept(self, sock, peer);
                    }
                }
                self.channels.put_back(event.token, Entry::Acceptor { acceptor, on_accept });
            }

            Entry::Connector { connector, on_connect } => {
                self.finish_connect(event.token, connector, on_connect);
            }

            Entry::Conn(mut conn) => {
                conn.handle_event(event, self);
                self.finish_conn_step(event.token, conn);
            }
        }
    }

    fn finish_connect(&mut self, token: usize, connector: Connector, on_connect: ConnectCallback) {
        self.poller.deregister(connector.fd());
        self.channels.release(token);

        let addr = *connector.target();
        let sock = connector.into_socket();

        match sock.take_error() {
            Ok(None) => {
                debug!(%addr, "connected");
                on_connect(self, sock);
            }
            Ok(Some(err)) => {
                error!(%addr, %err, "connect failed");
            }
            Err(err) => {
                error!(%addr, %err, "connect failed");
            }
        }
    }

    /// Puts a surviving connection back into its slot; a disconnected one
    /// gets its close callback and its slot released. Released slots stay
    /// quarantined until the cycle's reclaim, so a token still riding the
    /// current readiness batch cannot alias a new entry.
    fn finish_conn_step(&mut self, slot: usize, mut conn: Connection) {
        if conn.is_disconnected() {
            conn.emit_close(self);
            self.channels.release(slot);
        } else {
            self.channels.put_back(slot, Entry::Conn(conn));
        }
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some((id, mut state)) = self.timers.pop_due(now) {
            if state.interval.is_zero() {
                (state.callback)(self);
            } else {
                self.timers.begin_fire(id);
                (state.callback)(self);

                if self.timers.finish_fire() {
                    // Re-arm relative to this fire, not the original
                    // deadline: an overloaded loop drifts instead of
                    // firing back-to-back to catch up.
                    let deadline = Instant::now() + state.interval;
                    self.timers.rearm(id, state, deadline);
                }
            }
        }
    }

    fn drain_tasks(&mut self) {
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.draining = true;
            mem::take(&mut pending.tasks)
        };

        for task in tasks {
            task(self);
        }

        // Deferred callbacks queued by this snapshot run inside the drain
        // window: anything they queue lands in the next snapshot, and the
        // draining flag makes their run_later wake the poller for it.
        self.run_deferred();

        self.shared.pending.lock().unwrap().draining = false;
    }

    fn run_deferred(&mut self) {
        while !self.deferred.is_empty() {
            let batch = mem::take(&mut self.deferred);
            for task in batch {
                task(self);
            }
        }
    }
}
