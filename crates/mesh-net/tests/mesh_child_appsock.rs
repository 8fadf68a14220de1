use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
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
        thread::sleep(Duration::from_millis(25));
    }
    cond()
}

/// Two logical meshes multiplexed over one listen port per node. The child
/// rides the parent's accept path, selected by the connect record.
#[test]
fn child_net_shares_the_parent_listen_socket() {
    let cluster = ["nodea", "nodeb"];
    let a = mesh("nodea", 24890, &cluster);
    let b = mesh("nodeb", 24891, &cluster);

    let a_child = a.new_child(1, "childsvc", "0").unwrap();
    let b_child = b.new_child(1, "childsvc", "0").unwrap();
    for peer in cluster {
        a_child.add_host_alias(peer, "127.0.0.1");
        b_child.add_host_alias(peer, "127.0.0.1");
    }

    let parent_got = Arc::new(AtomicUsize::new(0));
    let child_got = Arc::new(AtomicUsize::new(0));
    {
        let parent_got = parent_got.clone();
        b.register_handler(3, "parent-sink", move |_| {
            parent_got.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    {
        let child_got = child_got.clone();
        b_child
            .register_handler(3, "child-sink", move |_| {
                child_got.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    a.add_peer("nodeb", 24891).unwrap();
    a_child.add_peer("nodeb", 24891).unwrap();

    a.start().unwrap();
    b.start().unwrap();
    a_child.start().unwrap();
    b_child.start().unwrap();

    assert!(wait_until(Duration::from_secs(25), || {
        a.got_hello("nodeb") && a_child.got_hello("nodeb")
    }));

    a.send("nodeb", 3, b"to-parent").unwrap();
    a_child.send("nodeb", 3, b"to-child").unwrap();
    a_child.send("nodeb", 3, b"to-child").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        parent_got.load(Ordering::Relaxed) == 1 && child_got.load(Ordering::Relaxed) == 2
    }),
        "messages crossed mesh boundaries: parent={} child={}",
        parent_got.load(Ordering::Relaxed),
        child_got.load(Ordering::Relaxed)
    );

    a_child.shutdown();
    b_child.shutdown();
    a.shutdown();
    b.shutdown();
}

/// Non-mesh connections are peeled off by their first byte and handed to
/// the appsock hooks; `@` is the admin sentinel.
#[test]
fn appsock_peel_off_and_watchlist() {
    let m = mesh("nodez", 24895, &["nodez"]);

    let admin_first: Arc<Mutex<Option<u8>>> = Arc::new(Mutex::new(None));
    {
        let admin_first = admin_first.clone();
        m.set_admin_appsock_hook(Arc::new(move |mut sock: TcpStream, first| {
            *admin_first.lock().unwrap() = Some(first);
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"@stat");
            sock.write_all(b"ok\n").unwrap();
        }));
    }
    m.set_appsock_hook(Arc::new(move |mut sock: TcpStream, first| {
        assert_eq!(first, b'Z');
        let mut buf = [0u8; 3];
        sock.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Zzz");
        sock.write_all(b"app\n").unwrap();
    }));
    m.start().unwrap();

    // plain appsock
    let mut sock = TcpStream::connect(("127.0.0.1", 24895)).unwrap();
    sock.write_all(b"Zzz").unwrap();
    let mut reply = [0u8; 4];
    sock.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"app\n");

    // admin appsock over loopback
    let mut sock = TcpStream::connect(("127.0.0.1", 24895)).unwrap();
    sock.write_all(b"@stat").unwrap();
    let mut reply = [0u8; 3];
    sock.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok\n");
    assert_eq!(*admin_first.lock().unwrap(), Some(b'@'));

    // a watched socket that goes idle is shut down by the checker; the far
    // end here stays open, so only the watchlist can end the read
    let quiet = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut idle = TcpStream::connect(quiet.local_addr().unwrap()).unwrap();
    let (_held_open, _) = quiet.accept().unwrap();
    let watched = idle.try_clone().unwrap();
    let _id = m.watch_socket(watched, Some(Duration::from_millis(300)), None);
    let t0 = Instant::now();
    let mut byte = [0u8; 1];
    let n = idle.read(&mut byte).unwrap_or(0);
    assert_eq!(n, 0, "watched socket was not shut down");
    assert!(t0.elapsed() >= Duration::from_millis(300));
    assert!(t0.elapsed() < Duration::from_secs(10));

    m.shutdown();
}
