use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use mesh_net::{Mesh, MeshConfig, SendError};

fn mesh(name: &str, port: u16, cluster: &[&str]) -> Mesh {
    let mesh = Mesh::new(MeshConfig::new("meshtest", "meshsvc", "0", name, port)).unwrap();
    // every node of the rig lives on loopback
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
fn two_nodes_discover_and_exchange_user_messages() {
    let cluster = ["nodea", "nodeb"];
    let a = mesh("nodea", 24840, &cluster);
    let b = mesh("nodeb", 24841, &cluster);

    let got: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    b.register_handler(5, "capture", move |ctx| {
        sink.lock().unwrap().push((ctx.from.to_owned(), ctx.body.to_vec()));
    })
    .unwrap();

    a.add_peer("nodeb", 24841).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    // dial jitter is up to 5s; hello must complete both ways
    assert!(
        wait_until(Duration::from_secs(20), || {
            a.got_hello("nodeb") && b.got_hello("nodea")
        }),
        "hello exchange did not complete"
    );

    // gossip taught B about A without B ever being seeded
    let mut a_peers = a.peers();
    let mut b_peers = b.peers();
    a_peers.sort();
    b_peers.sort();
    assert_eq!(a_peers, ["nodea", "nodeb"]);
    assert_eq!(b_peers, ["nodea", "nodeb"]);

    a.send("nodeb", 5, b"abc").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || !got.lock().unwrap().is_empty()),
        "handler never saw the message"
    );
    let (from, body) = got.lock().unwrap()[0].clone();
    assert_eq!(from, "nodea");
    assert_eq!(body, b"abc");

    // local caller errors, none of which touch a socket
    assert_eq!(a.send("nodea", 5, b"x"), Err(SendError::SendToMe));
    assert_eq!(a.send("nosuchnode", 5, b"x"), Err(SendError::InvalidNode));
    // a message for an unregistered type is dropped remotely, not an error
    a.send("nodeb", 6, b"ignored").unwrap();

    let stats = a.peer_stats("nodeb").unwrap();
    assert!(stats.connected);
    assert!(stats.got_hello);
    assert!(stats.bytes_tx > 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn per_peer_fifo_is_preserved_under_load() {
    const COUNT: u32 = 10_000;
    let cluster = ["nodea", "nodeb"];
    let a = mesh("nodea", 24850, &cluster);
    let b = mesh("nodeb", 24851, &cluster);

    let got: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    b.register_handler(7, "ordered", move |ctx| {
        let key = u32::from_be_bytes(ctx.body.try_into().unwrap());
        sink.lock().unwrap().push(key);
    })
    .unwrap();

    a.add_peer("nodeb", 24851).unwrap();
    a.start().unwrap();
    b.start().unwrap();
    assert!(wait_until(Duration::from_secs(20), || a.got_hello("nodeb")));

    let deadline = Instant::now() + Duration::from_secs(60);
    for key in 0..COUNT {
        loop {
            match a.send("nodeb", 7, &key.to_be_bytes()) {
                Ok(()) => break,
                Err(SendError::QueueFull) => thread::sleep(Duration::from_micros(200)),
                Err(err) => panic!("send {key} failed: {err}"),
            }
            assert!(Instant::now() < deadline, "backpressure never cleared");
        }
    }

    assert!(
        wait_until(Duration::from_secs(60), || got.lock().unwrap().len() == COUNT as usize),
        "only {} of {COUNT} messages arrived",
        got.lock().unwrap().len()
    );
    let received = got.lock().unwrap();
    assert!(received.iter().copied().eq(0..COUNT), "delivery order diverged from send order");

    a.shutdown();
    b.shutdown();
}
