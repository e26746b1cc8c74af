mod common;

use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::spawn_loop;
use eddy::{Acceptor, Callbacks, ConnOptions, Pool};

#[test]
fn connections_are_dealt_round_robin() {
    let (handle, loop_thread) = spawn_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (pick_tx, pick_rx) = mpsc::channel();
    let (tid_tx, tid_rx) = mpsc::channel();
    let (workers_tx, workers_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let mut pool = Pool::start(lp, 3).expect("Failed to start pool");
        let workers = pool.handles().to_vec();
        workers_tx
            .send(workers.clone())
            .expect("Failed to hand back workers");

        let acceptor = Acceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        addr_tx
            .send(acceptor.local_addr())
            .expect("Failed to hand back address");

        let pick_tx = pick_tx.clone();
        let tid_tx = tid_tx.clone();
        lp.start_accept(acceptor, move |_lp, sock, _peer| {
            let target = pool.next();
            let index = workers
                .iter()
                .position(|worker| *worker == target)
                .expect("Pool returned an unknown worker");
            pick_tx.send(index).expect("Failed to report pick");

            let tid_tx = tid_tx.clone();
            let callbacks = Callbacks::new().on_connect(move |_ctx| {
                tid_tx
                    .send(thread::current().id())
                    .expect("Failed to report owner thread");
            });

            target.adopt(sock, ConnOptions::new("pooled"), callbacks);
        });
    });

    let addr = addr_rx.recv().expect("Acceptor never started");
    let workers = workers_rx.recv().expect("Workers never handed back");

    let mut clients = Vec::new();
    let mut picks = Vec::new();
    let mut owners = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(addr).expect("Failed to connect"));
        picks.push(
            pick_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("Accept never happened"),
        );
        owners.push(
            tid_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("Connection never established"),
        );
    }

    assert_eq!(picks, vec![0, 1, 2, 0], "Round-robin order broken");

    assert_eq!(owners[0], owners[3], "Wrapped pick landed on another thread");
    assert_ne!(owners[0], owners[1]);
    assert_ne!(owners[0], owners[2]);
    assert_ne!(owners[1], owners[2]);

    drop(clients);
    for worker in &workers {
        worker.stop();
    }
    handle.stop();
    loop_thread.join().expect("Loop thread panicked");
}

#[test]
fn empty_pool_degenerates_to_the_host_loop() {
    let (handle, loop_thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let mut pool = Pool::start(lp, 0).expect("Failed to start pool");
        let host = lp.handle();

        tx.send(pool.next() == host && pool.next() == host)
            .expect("Failed to report");
    });

    assert!(
        rx.recv_timeout(Duration::from_secs(5))
            .expect("Task never ran"),
        "Empty pool must return the host loop"
    );

    handle.stop();
    loop_thread.join().expect("Loop thread panicked");
}
