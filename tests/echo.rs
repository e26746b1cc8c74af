mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use common::spawn_loop;
use eddy::{Acceptor, Callbacks, ConnOptions, Connector, LoopHandle};

/// Starts an echo server on an ephemeral port on the given loop.
fn start_echo_server(
    handle: &LoopHandle,
    options: ConnOptions,
    events: Option<mpsc::Sender<&'static str>>,
) -> SocketAddr {
    let (addr_tx, addr_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let acceptor = Acceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        addr_tx
            .send(acceptor.local_addr())
            .expect("Failed to hand back address");

        let mut options = Some(options);
        lp.start_accept(acceptor, move |lp, sock, _peer| {
            let connect_events = events.clone();
            let message_events = events.clone();

            let callbacks = Callbacks::new()
                .on_connect(move |_ctx| {
                    if let Some(tx) = &connect_events {
                        tx.send("connect").expect("Failed to report connect");
                    }
                })
                .on_message(move |ctx, buf| {
                    if let Some(tx) = &message_events {
                        tx.send("message").expect("Failed to report message");
                    }
                    let data = buf.as_bytes().to_vec();
                    buf.consume(data.len());
                    ctx.send(&data);
                });

            let options = options.take().expect("Server accepts a single connection");
            lp.adopt(sock, options, callbacks);
        });
    });

    addr_rx.recv().expect("Acceptor never started")
}

#[test]
fn connect_fires_before_any_message() {
    let (handle, thread) = spawn_loop();
    let (ev_tx, ev_rx) = mpsc::channel();

    let addr = start_echo_server(&handle, ConnOptions::new("server"), Some(ev_tx));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client.write_all(b"hello").expect("Failed to write");

    assert_eq!(ev_rx.recv_timeout(Duration::from_secs(5)), Ok("connect"));
    assert_eq!(ev_rx.recv_timeout(Duration::from_secs(5)), Ok("message"));

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).expect("Failed to read echo");
    assert_eq!(&buf, b"hello");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn burst_larger_than_input_capacity_is_delivered_whole() {
    let (handle, thread) = spawn_loop();

    // The whole burst cannot fit in one read; the server must deliver it
    // across several read cycles without loss or duplication.
    let addr = start_echo_server(
        &handle,
        ConnOptions::new("server").input_capacity(16),
        None,
    );

    let payload: Vec<u8> = (0..100u8).collect();
    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client.write_all(&payload).expect("Failed to write burst");

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).expect("Failed to read echo");
    assert_eq!(echoed, payload, "Burst was corrupted in transit");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn unconsumed_bytes_persist_into_the_next_delivery() {
    let (handle, thread) = spawn_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (first_tx, first_rx) = mpsc::channel();
    let (second_tx, second_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let acceptor = Acceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        addr_tx
            .send(acceptor.local_addr())
            .expect("Failed to hand back address");

        let first_tx = first_tx.clone();
        let second_tx = second_tx.clone();
        lp.start_accept(acceptor, move |lp, sock, _peer| {
            let first_tx = first_tx.clone();
            let second_tx = second_tx.clone();
            let mut phase = 0;

            let callbacks = Callbacks::new().on_message(move |_ctx, buf| match phase {
                0 if buf.len() >= 10 => {
                    first_tx
                        .send(buf.as_bytes().to_vec())
                        .expect("Failed to report first delivery");
                    buf.consume(4);
                    phase = 1;
                }
                1 if buf.len() >= 8 => {
                    second_tx
                        .send(buf.as_bytes().to_vec())
                        .expect("Failed to report second delivery");
                    let len = buf.len();
                    buf.consume(len);
                    phase = 2;
                }
                _ => {}
            });

            lp.adopt(sock, ConnOptions::new("server"), callbacks);
        });
    });

    let addr = addr_rx.recv().expect("Acceptor never started");
    let mut client = TcpStream::connect(addr).expect("Failed to connect");

    client.write_all(b"0123456789").expect("Failed to write");
    let first = first_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("First delivery missing");
    assert_eq!(first, b"0123456789");

    // Four bytes were consumed; the remaining six must survive compaction
    // and come back prepended to the next write.
    client.write_all(b"AB").expect("Failed to write");
    let second = second_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Second delivery missing");
    assert_eq!(second, b"456789AB");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn stalled_full_input_buffer_closes_the_connection() {
    let (handle, thread) = spawn_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (closed_tx, closed_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let acceptor = Acceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        addr_tx
            .send(acceptor.local_addr())
            .expect("Failed to hand back address");

        let closed_tx = closed_tx.clone();
        lp.start_accept(acceptor, move |lp, sock, _peer| {
            let closed_tx = closed_tx.clone();

            // A callback that never consumes: once the buffer fills, no
            // delivery can make progress.
            let callbacks = Callbacks::new()
                .on_message(|_ctx, _buf| {})
                .on_close(move |_ctx| {
                    closed_tx.send(()).expect("Failed to report close");
                });

            lp.adopt(
                sock,
                ConnOptions::new("stalled").input_capacity(8),
                callbacks,
            );
        });
    });

    let addr = addr_rx.recv().expect("Acceptor never started");
    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client.write_all(&[0u8; 20]).expect("Failed to write");

    closed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Stalled connection was never closed");

    // The server closed with unread data, so the client sees either a
    // clean EOF or a reset; both prove the teardown.
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "Server did not close the socket"),
        Err(_) => {}
    }

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn stop_read_pauses_delivery_until_start_read() {
    let (handle, thread) = spawn_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();
    let (msg_tx, msg_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let acceptor = Acceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        addr_tx
            .send(acceptor.local_addr())
            .expect("Failed to hand back address");

        let conn_tx = conn_tx.clone();
        let msg_tx = msg_tx.clone();
        lp.start_accept(acceptor, move |lp, sock, _peer| {
            let conn_tx = conn_tx.clone();
            let msg_tx = msg_tx.clone();

            let callbacks = Callbacks::new()
                .on_connect(move |ctx| {
                    ctx.stop_read();
                    conn_tx.send(ctx.handle()).expect("Failed to hand back handle");
                })
                .on_message(move |_ctx, buf| {
                    let len = buf.len();
                    msg_tx
                        .send(buf.as_bytes().to_vec())
                        .expect("Failed to report delivery");
                    buf.consume(len);
                });

            lp.adopt(sock, ConnOptions::new("paused"), callbacks);
        });
    });

    let addr = addr_rx.recv().expect("Acceptor never started");
    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    let conn = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Connection never established");

    client.write_all(b"held back").expect("Failed to write");
    assert!(
        msg_rx.recv_timeout(Duration::from_millis(150)).is_err(),
        "Delivery happened while reading was stopped"
    );

    conn.start_read();
    let delivered = msg_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Delivery never resumed");
    assert_eq!(delivered, b"held back");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn connector_completes_and_streams() {
    let (handle, thread) = spawn_loop();
    let (msg_tx, msg_rx) = mpsc::channel();

    let addr = start_echo_server(&handle, ConnOptions::new("server"), None);

    handle.run_later(move |lp| {
        let connector = Connector::new(&addr.to_string()).expect("Failed to create connector");

        lp.start_connect(connector, move |lp, sock| {
            let callbacks = Callbacks::new()
                .on_connect(|ctx| ctx.send(b"ping"))
                .on_message(move |ctx, buf| {
                    if buf.len() >= 4 {
                        msg_tx
                            .send(buf.as_bytes().to_vec())
                            .expect("Failed to report echo");
                        let len = buf.len();
                        buf.consume(len);
                        ctx.shutdown();
                    }
                });

            lp.adopt(sock, ConnOptions::new("client"), callbacks);
        });
    });

    let echoed = msg_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Echo never arrived");
    assert_eq!(echoed, b"ping");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}
