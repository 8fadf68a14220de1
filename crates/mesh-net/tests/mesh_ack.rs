use std::{
    thread,
    time::{Duration, Instant},
};

use mesh_net::{Mesh, MeshConfig, SendError};

fn mesh(name: &str, port: u16, cluster: &[&str]) -> Mesh {
    let mesh = Mesh::new(MeshConfig::new("meshtest", "meshsvc", "0", name, port)).unwrap();
    for peer in cluster {
        mesh.add_host_alias(peer, "127.0.0.1");
    }
    mesh
}

fn wait_until(budget: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    cond()
}

#[test]
fn synchronous_sends_carry_the_handler_rc() {
    let cluster = ["nodea", "nodeb"];
    let a = mesh("nodea", 24860, &cluster);
    let b = mesh("nodeb", 24861, &cluster);

    b.register_handler(9, "answer-42", |ctx| {
        assert_eq!(ctx.body, b"ping");
        ctx.take_ack().expect("sender asked for an ack").ack(42).unwrap();
    })
    .unwrap();
    b.register_handler(11, "payload", |ctx| {
        ctx.take_ack().unwrap().ack_with_payload(7, b"pong").unwrap();
    })
    .unwrap();
    b.register_handler(12, "negative", |ctx| {
        // negative codes are reserved for the transport
        ctx.take_ack().unwrap().ack(-5).unwrap();
    })
    .unwrap();
    b.register_handler(13, "silent", |ctx| {
        // dropping the handle without acking leaves the sender to time out
        let _ = ctx.take_ack();
    })
    .unwrap();

    a.add_peer("nodeb", 24861).unwrap();
    a.start().unwrap();
    b.start().unwrap();
    assert!(wait_until(Duration::from_secs(20), || a.got_hello("nodeb")));

    assert_eq!(a.send_with_ack("nodeb", 9, b"ping", 5_000), Ok(42));

    let (rc, payload) = a.send_with_ack_payload("nodeb", 11, b"x", 5_000).unwrap();
    assert_eq!(rc, 7);
    assert_eq!(payload.as_deref(), Some(&b"pong"[..]));

    assert_eq!(a.send_with_ack("nodeb", 12, b"x", 5_000), Err(SendError::InvalidAckRc));

    // no handler registered: the message is dropped remotely
    let t0 = Instant::now();
    assert_eq!(a.send_with_ack("nodeb", 10, b"x", 1_000), Err(SendError::Timeout));
    assert!(t0.elapsed() >= Duration::from_millis(1_000));

    // handler that never acks behaves the same as no handler
    assert_eq!(a.send_with_ack("nodeb", 13, b"x", 1_000), Err(SendError::Timeout));

    // concurrent acks must not cross seqnums
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let a = a.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    assert_eq!(a.send_with_ack("nodeb", 9, b"ping", 5_000), Ok(42));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let stats = b.handler_stats();
    let answer = stats.iter().find(|h| h.usertype == 9).unwrap();
    assert!(answer.calls >= 161);
    assert_eq!(answer.name, "answer-42");

    a.shutdown();
    b.shutdown();
}
