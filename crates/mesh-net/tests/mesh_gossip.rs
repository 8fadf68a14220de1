use std::{
    thread,
    time::{Duration, Instant},
};

use mesh_net::{Mesh, MeshConfig};

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
        thread::sleep(Duration::from_millis(50));
    }
    cond()
}

/// Seeding is transitive: A and C each only know B, yet the hello exchange
/// must leave every node with the full cluster and a direct A-C link.
#[test]
fn three_nodes_converge_from_a_single_seed() {
    let cluster = ["nodea", "nodeb", "nodec"];
    let a = mesh("nodea", 24870, &cluster);
    let b = mesh("nodeb", 24871, &cluster);
    let c = mesh("nodec", 24872, &cluster);

    a.add_peer("nodeb", 24871).unwrap();
    c.add_peer("nodeb", 24871).unwrap();

    a.start().unwrap();
    b.start().unwrap();
    c.start().unwrap();

    let full = |m: &Mesh| {
        let mut peers = m.peers();
        peers.sort();
        peers == cluster
    };
    assert!(
        wait_until(Duration::from_secs(45), || full(&a) && full(&b) && full(&c)),
        "peer tables never closed over: a={:?} b={:?} c={:?}",
        a.peers(),
        b.peers(),
        c.peers()
    );

    // the learned edge becomes a real connection, not just an entry
    assert!(
        wait_until(Duration::from_secs(45), || {
            a.got_hello("nodec") && c.got_hello("nodea")
        }),
        "no direct connection between the two leaves"
    );

    let counts = b.counts();
    assert_eq!(counts.total, 3);
    assert!(counts.connected >= 2);

    // sanctioned list is orthogonal to discovery
    b.sanction("nodea");
    b.sanction("nodec");
    b.sanction("nodea"); // idempotent
    assert_eq!(b.sanctioned().len(), 2);
    let counts = b.counts();
    assert_eq!(counts.sanctioned, 2);
    assert!(counts.sanctioned_connected >= 2);

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[test]
fn decommissioned_peer_stays_out() {
    let cluster = ["noded", "nodee"];
    let d = mesh("noded", 24880, &cluster);
    let e = mesh("nodee", 24881, &cluster);

    d.add_peer("nodee", 24881).unwrap();
    d.start().unwrap();
    e.start().unwrap();
    assert!(wait_until(Duration::from_secs(20), || d.got_hello("nodee")));

    d.decom("nodee");
    assert!(!d.peers().iter().any(|p| p == "nodee"));
    assert!(d.send("nodee", 5, b"x").is_err());

    // E keeps redialing; the tombstone must keep it from slipping back in
    thread::sleep(Duration::from_secs(8));
    assert!(
        !d.peers().iter().any(|p| p == "nodee"),
        "decommissioned peer re-entered the table"
    );

    // an explicit re-add clears the tombstone
    d.add_peer("nodee", 24881).unwrap();
    assert!(wait_until(Duration::from_secs(20), || d.got_hello("nodee")));

    d.shutdown();
    e.shutdown();
}
