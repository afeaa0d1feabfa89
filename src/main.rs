//! Demonstration server
//!
//! Wires the concurrency core end to end: accept reactor -> I/O reactors ->
//! thread pool -> response queues. The handler is a stand-in for the real
//! protocol layer: it treats each received chunk as a request, does its
//! "work" on the pool, and posts the reply back to the owning reactor.

use std::io::{self, Read};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use maelstrom::net::{ConnectionContext, EventHandler, HandlerFactory, ReplySender};
use maelstrom::{AcceptReactor, HybridThreadPool, PoolConfig, ReactorConfig, TaskClass};

const LISTEN_ADDR: &str = "127.0.0.1:7600";

struct EchoHandler {
    sender: ReplySender,
    pool: Arc<HybridThreadPool>,
}

impl EventHandler for EchoHandler {
    fn on_readable(&mut self, ctx: &mut ConnectionContext) {
        let mut buf = [0u8; 4096];
        loop {
            match ctx.stream.read(&mut buf) {
                Ok(0) => {
                    ctx.request_close();
                    return;
                }
                Ok(n) => {
                    let request = buf[..n].to_vec();
                    let sender = self.sender.clone();
                    let fd = ctx.fd();
                    let accepted = self.pool.submit(
                        Box::new(move || {
                            // Placeholder for command handling; reverse the
                            // bytes so replies are visibly processed.
                            let mut reply = request;
                            reply.reverse();
                            sender.send(fd, reply);
                        }),
                        TaskClass::Flexible,
                    );
                    if !accepted {
                        ctx.request_close();
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    ctx.request_close();
                    return;
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let pool = Arc::new(
        HybridThreadPool::new(PoolConfig::default().with_workers(0, num_cpus::get().max(2)))
            .context("thread pool startup failed")?,
    );

    let factory: Arc<HandlerFactory> = {
        let pool = pool.clone();
        Arc::new(move |sender, _fd| {
            Box::new(EchoHandler {
                sender,
                pool: pool.clone(),
            })
        })
    };

    let acceptor = AcceptReactor::bind(LISTEN_ADDR, ReactorConfig::default(), factory)
        .context("reactor startup failed")?;
    info!(
        addr = LISTEN_ADDR,
        port = acceptor.local_port()?,
        "maelstrom demo server running"
    );

    // The reactors and pool run until the process is killed.
    loop {
        std::thread::park();
    }
}
