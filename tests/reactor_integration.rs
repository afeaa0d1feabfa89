//! End-to-end reactor tests: accept -> dispatch -> pool -> response queue

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use maelstrom::net::{ConnectionContext, EventHandler, HandlerFactory, ReplySender};
use maelstrom::{AcceptReactor, HybridThreadPool, PoolConfig, ReactorConfig, TaskClass};

/// Parses nothing: every received chunk is a "request" answered by the pool
/// with the same bytes reversed.
struct ReverseHandler {
    sender: ReplySender,
    pool: Arc<HybridThreadPool>,
}

impl EventHandler for ReverseHandler {
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
                    assert!(self.pool.submit(
                        Box::new(move || {
                            let mut reply = request;
                            reply.reverse();
                            sender.send(fd, reply);
                        }),
                        TaskClass::Flexible,
                    ));
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

fn start_server(io_reactors: usize) -> (AcceptReactor, Arc<HybridThreadPool>, u16) {
    let pool = Arc::new(HybridThreadPool::new(PoolConfig::default().with_workers(0, 2)).unwrap());
    let factory: Arc<HandlerFactory> = {
        let pool = pool.clone();
        Arc::new(move |sender, _fd| {
            Box::new(ReverseHandler {
                sender,
                pool: pool.clone(),
            })
        })
    };
    let acceptor = AcceptReactor::bind(
        "127.0.0.1:0",
        ReactorConfig::default().with_io_reactors(io_reactors),
        factory,
    )
    .unwrap();
    let port = acceptor.local_port().unwrap();
    (acceptor, pool, port)
}

fn round_trip(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    client.write_all(payload).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reply = vec![0u8; payload.len()];
    client.read_exact(&mut reply).unwrap();
    reply
}

/// 12 clients over 4 reactors: each reactor ends up owning exactly 3
/// descriptors, and every request is answered through the full
/// dispatch -> pool -> response-queue path.
#[test]
fn test_round_robin_ownership_and_replies() {
    let (acceptor, _pool, port) = start_server(4);

    let mut clients = Vec::new();
    for i in 0..12u8 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Confirm the connection is registered and serviced before opening
        // the next one, so assignment order is deterministic.
        let msg = vec![b'a' + i, b'-', b'0' + i % 10];
        let mut expected = msg.clone();
        expected.reverse();
        assert_eq!(round_trip(&mut client, &msg), expected);
        clients.push(client);
    }

    let handles = acceptor.io_handles();
    assert_eq!(handles.len(), 4);
    for handle in &handles {
        assert_eq!(handle.connection_count(), 3);
    }

    // A reply submitted from an arbitrary thread lands on the reactor owning
    // the descriptor, which writes it to the right client.
    let target_fd = handles[2].connection_fds()[0];
    let owner = acceptor.owner_of(target_fd).unwrap();
    assert_eq!(owner.id(), handles[2].id());

    drop(clients);
}

#[test]
fn test_many_interleaved_requests() {
    let (_acceptor, _pool, port) = start_server(2);

    let mut workers = Vec::new();
    for c in 0..4u8 {
        workers.push(std::thread::spawn(move || {
            let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
            for i in 0..50u8 {
                let msg = vec![c, i, i.wrapping_mul(7)];
                let mut expected = msg.clone();
                expected.reverse();
                assert_eq!(round_trip(&mut client, &msg), expected);
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn test_client_disconnect_releases_connection_state() {
    let (acceptor, _pool, port) = start_server(1);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(round_trip(&mut client, b"xyz"), b"zyx".to_vec());

    let handle = &acceptor.io_handles()[0];
    assert_eq!(handle.connection_count(), 1);

    drop(client);
    let mut released = false;
    for _ in 0..500 {
        if handle.connection_count() == 0 {
            released = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(released, "connection state survived peer disconnect");
}
