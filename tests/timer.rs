mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::spawn_loop;

#[test]
fn one_shot_fires_after_delay() {
    let (handle, thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    let started = Instant::now();
    handle.run_later(move |lp| {
        lp.schedule_after(Duration::from_millis(30), move |_| {
            tx.send(Instant::now()).expect("Failed to report fire");
        });
    });

    let fired_at = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timer never fired");
    assert!(
        fired_at - started >= Duration::from_millis(30),
        "Timer fired early"
    );

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn timers_fire_in_deadline_order() {
    let (handle, thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    let tx_late = tx.clone();
    handle.run_later(move |lp| {
        lp.schedule_after(Duration::from_millis(40), move |_| {
            tx_late.send("late").expect("Failed to report");
        });
        lp.schedule_after(Duration::from_millis(10), move |_| {
            tx.send("early").expect("Failed to report");
        });
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("early"));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("late"));

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn periodic_rearms_from_fire_time_not_original_deadline() {
    let (handle, thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    // The callback stalls the loop past its own next deadline. An
    // implementation anchored to the original schedule would fire again
    // immediately; re-arming from the fire time keeps a full interval
    // between runs.
    handle.run_later(move |lp| {
        let tx = tx.clone();
        lp.schedule_every(Duration::from_millis(50), move |_| {
            tx.send(Instant::now()).expect("Failed to report fire");
            thread::sleep(Duration::from_millis(80));
        });
    });

    let first = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("First fire missing");
    let second = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Second fire missing");

    assert!(
        second - first >= Duration::from_millis(120),
        "Periodic timer burst instead of drifting: gap {:?}",
        second - first
    );

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn cancel_prevents_fire() {
    let (handle, thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let id = lp.schedule_after(Duration::from_millis(50), move |_| {
            tx.send(()).expect("Failed to report fire");
        });
        lp.cancel_timer(id);
    });

    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "Cancelled timer fired anyway"
    );

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn cancel_after_fire_is_a_no_op() {
    let (handle, thread) = spawn_loop();
    let (fired_tx, fired_rx) = mpsc::channel();
    let (id_tx, id_rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let id = lp.schedule_after(Duration::ZERO, move |_| {
            fired_tx.send(()).expect("Failed to report fire");
        });
        id_tx.send(id).expect("Failed to hand back timer id");
    });

    let id = id_rx.recv().expect("Timer id missing");
    fired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Timer never fired");

    // Cancelling a spent one-shot, twice, from another thread: both are
    // absorbed and the loop keeps serving.
    let (tx, rx) = mpsc::channel();
    handle.run_later(move |lp| {
        lp.cancel_timer(id);
        lp.cancel_timer(id);
        tx.send(()).expect("Failed to signal");
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("Loop died on redundant cancel");

    handle.stop();
    thread.join().expect("Loop thread panicked");
}

#[test]
fn periodic_stops_when_cancelled_from_its_own_callback() {
    use std::cell::Cell;
    use std::rc::Rc;

    let (handle, thread) = spawn_loop();
    let (tx, rx) = mpsc::channel();

    handle.run_later(move |lp| {
        let own_id = Rc::new(Cell::new(None));
        let slot = own_id.clone();
        let mut runs = 0u32;

        let id = lp.schedule_every(Duration::from_millis(10), move |lp| {
            runs += 1;
            tx.send(runs).expect("Failed to report run");
            if runs == 2 {
                let id = slot.get().expect("Own id not threaded in");
                lp.cancel_timer(id);
            }
        });
        own_id.set(Some(id));
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "Periodic timer kept firing after cancelling itself"
    );

    handle.stop();
    thread.join().expect("Loop thread panicked");
}
