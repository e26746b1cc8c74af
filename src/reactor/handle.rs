use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::net::conn::{Callbacks, ConnOptions};
use crate::net::socket::TcpSocket;
use crate::reactor::core::EventLoop;
use crate::reactor::poller::Waker;

pub(crate) type Task = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;

#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) tasks: Vec<Task>,
    /// True while the owning thread runs a task snapshot. Tasks queued in
    /// that window land in the next snapshot, so the poller must be woken
    /// or they would wait for an unrelated readiness event.
    pub(crate) draining: bool,
}

pub(crate) struct LoopShared {
    pub(crate) pending: Mutex<Pending>,
    pub(crate) owner: ThreadId,
    pub(crate) live: AtomicBool,
    pub(crate) waker: Arc<Waker>,
}

/// Cross-thread face of an [`EventLoop`].
///
/// The task queue behind this handle is the only channel through which
/// other threads may touch a loop; everything the loop owns is mutated on
/// its own thread, by the queued task itself.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queues `task` for execution on the loop's thread.
    ///
    /// Tasks from one caller thread run in the order they were queued;
    /// there is no ordering across callers.
    pub fn run_later(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let wake = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.tasks.push(Box::new(task));
            pending.draining || !self.is_in_loop()
        };

        if wake {
            self.shared.waker.wake();
        }
    }

    /// Hands a socket to this loop, which adopts it as a connection and
    /// establishes it. The loop owns the connection from then on; keep the
    /// [`ConnHandle`](crate::ConnHandle) from a callback context to reach
    /// it from other threads.
    pub fn adopt(&self, socket: TcpSocket, options: ConnOptions, callbacks: Callbacks) {
        self.run_later(move |lp| {
            lp.adopt(socket, options, callbacks);
        });
    }

    /// Asks the loop to exit after its current cycle.
    pub fn stop(&self) {
        self.shared.live.store(false, Ordering::Release);
        self.shared.waker.wake();
    }

    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Panics when called off the owning thread. Affinity violations are
    /// programming errors, not recoverable conditions.
    pub fn assert_in_loop(&self) {
        assert!(
            self.is_in_loop(),
            "operation invoked off the owning loop thread"
        );
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}
