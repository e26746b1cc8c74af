//! Example: TCP echo server spreading connections over a worker pool.

use eddy::{Acceptor, Callbacks, ConnOptions, EventLoop, Pool};

fn main() -> eddy::Result<()> {
    tracing_subscriber::fmt::init();

    let mut lp = EventLoop::new()?;
    let mut pool = Pool::start(&lp, 2)?;

    let acceptor = Acceptor::bind("127.0.0.1:9000")?;
    println!("echo server listening on {}", acceptor.local_addr());

    let mut next_id = 0u64;
    lp.start_accept(acceptor, move |_lp, sock, peer| {
        next_id += 1;
        println!("accepted {peer}");

        let callbacks = Callbacks::new()
            .on_message(|ctx, buf| {
                // Echo whatever arrived back to the peer.
                let data = buf.as_bytes().to_vec();
                buf.consume(data.len());
                ctx.send(&data);
            })
            .on_close(|ctx| println!("{} closed", ctx.name()));

        pool.next()
            .adopt(sock, ConnOptions::new(format!("echo#{next_id}")), callbacks);
    });

    lp.run()
}
