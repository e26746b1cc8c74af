use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::reactor::core::EventLoop;
use crate::reactor::handle::LoopHandle;

/// A fixed set of worker loops fed round-robin.
///
/// Each worker thread constructs its own [`EventLoop`]: the loop type is
/// not `Send`, so building it on the thread that will run it is the only
/// way to get one there, and thread affinity holds by construction. The
/// pool never resizes after start.
pub struct Pool {
    host: LoopHandle,
    workers: Vec<LoopHandle>,
    threads: Vec<JoinHandle<()>>,
    cursor: usize,
}

impl Pool {
    /// Spawns `n` worker loops on dedicated threads. Thread-affine to the
    /// host loop.
    pub fn start(host: &EventLoop, n: usize) -> Result<Self> {
        host.assert_in_loop();

        let mut workers = Vec::with_capacity(n);
        let mut threads = Vec::with_capacity(n);

        for i in 0..n {
            let (tx, rx) = mpsc::channel();

            let thread = thread::Builder::new()
                .name(format!("eddy-worker-{i}"))
                .spawn(move || {
                    let mut lp = match EventLoop::new() {
                        Ok(lp) => lp,
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };

                    let _ = tx.send(Ok(lp.handle()));

                    if let Err(err) = lp.run() {
                        error!(worker = i, %err, "worker loop failed");
                    }
                })
                .map_err(Error::Io)?;

            match rx.recv() {
                Ok(Ok(handle)) => {
                    workers.push(handle);
                    threads.push(thread);
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::Io(io::Error::other("worker thread died at startup"))),
            }
        }

        debug!(workers = n, "pool started");

        Ok(Self {
            host: host.handle(),
            workers,
            threads,
            cursor: 0,
        })
    }

    /// The loop that should own the next connection: the host loop when
    /// the pool is empty, otherwise the workers in cyclic order.
    /// Thread-affine to the host loop.
    pub fn next(&mut self) -> LoopHandle {
        self.host.assert_in_loop();

        if self.workers.is_empty() {
            return self.host.clone();
        }

        let handle = self.workers[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.workers.len();

        handle
    }

    pub fn handles(&self) -> &[LoopHandle] {
        &self.workers
    }

    /// Stops every worker loop and joins its thread. Callable from any
    /// thread; intended for orderly teardown of the embedding application.
    pub fn stop_and_join(mut self) {
        for worker in &self.workers {
            worker.stop();
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
