use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use eddy::{EventLoop, LoopHandle};

/// Runs an event loop on a fresh thread and hands back its handle.
pub fn spawn_loop() -> (LoopHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let mut lp = EventLoop::new().expect("Failed to create event loop");
        tx.send(lp.handle()).expect("Failed to hand back handle");
        lp.run().expect("Event loop failed");
    });

    let handle = rx.recv().expect("Loop thread died during startup");
    (handle, thread)
}
