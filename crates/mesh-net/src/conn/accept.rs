use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    time::Duration,
};

use mesh_wire::{ConnectFlags, ConnectMsg, CONNECT_TAG};
use tracing::{debug, info, warn};

use crate::{
    conn::sockopt,
    gossip,
    hooks::TlsPolicy,
    mesh::MeshInner,
    timing::sleep_unless,
};

/// Admin appsocks announce themselves with this first byte and must come
/// from loopback.
const ADMIN_SENTINEL: u8 = b'@';

/// How long the accept path waits for a peer's stale workers to let go of
/// their socket before giving up on the new connection.
const STALE_WORKER_WAIT: Duration = Duration::from_secs(5);

/// One accept thread per mesh (parent nets only; child nets share it).
pub(crate) fn accept_loop(mesh: &Arc<MeshInner>, listener: TcpListener) {
    loop {
        let (sock, addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                if mesh.exiting() {
                    break;
                }
                warn!(%err, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if mesh.exiting() {
            break;
        }
        // peel-off may block up to netpoll; keep the accept loop hot
        let admitting = mesh.clone();
        let _detached = mesh.spawn_thread("net-admit", move || admit(&admitting, sock, addr));
    }
    debug!("accept thread exiting");
}

/// Classify one inbound connection: mesh connect record vs appsock, then
/// route it.
fn admit(mesh: &Arc<MeshInner>, sock: TcpStream, addr: SocketAddr) {
    if let Err(err) = sockopt::set_mesh_sockopts(&sock, mesh.tunables.sock_buf_size()) {
        debug!(%addr, %err, "sockopts failed on accepted socket");
        return;
    }

    let netpoll = Duration::from_millis(mesh.tunables.netpoll_ms());
    match sockopt::wait_readable(&sock, netpoll) {
        Ok(true) => {}
        Ok(false) => {
            debug!(%addr, "no data within netpoll, dropping");
            return;
        }
        Err(err) => {
            debug!(%addr, %err, "poll on accepted socket failed");
            return;
        }
    }

    let first = match sockopt::peek_byte(&sock) {
        Ok(Some(b)) => b,
        Ok(None) => return,
        Err(err) => {
            debug!(%addr, %err, "peek failed");
            return;
        }
    };

    if first != CONNECT_TAG {
        route_appsock(mesh, sock, addr, first);
        return;
    }
    admit_mesh_peer(mesh, sock, addr);
}

fn route_appsock(mesh: &Arc<MeshInner>, sock: TcpStream, addr: SocketAddr, first: u8) {
    if first == ADMIN_SENTINEL {
        if !addr.ip().is_loopback() {
            warn!(%addr, "admin appsock from non-loopback origin rejected");
            return;
        }
        match mesh.hook_admin_appsock() {
            Some(hook) => hook(sock, first),
            None => debug!(%addr, "admin appsock but no hook registered"),
        }
        return;
    }
    match mesh.hook_appsock() {
        Some(hook) => hook(sock, first),
        None => debug!(%addr, first, "appsock but no hook registered"),
    }
}

fn admit_mesh_peer(parent: &Arc<MeshInner>, sock: TcpStream, addr: SocketAddr) {
    sockopt::set_linger_zero(&sock);
    // consume the tag byte, then the connect record
    let mut reader = &sock;
    {
        use std::io::Read;
        let mut tag = [0u8; 1];
        if reader.read_exact(&mut tag).is_err() {
            return;
        }
    }
    let msg = match ConnectMsg::read_from(&mut reader) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%addr, %err, "malformed connect record");
            return;
        }
    };

    // child-net demux rides the to_port high bits
    let mesh = if msg.to_netnum == 0 {
        parent.clone()
    } else {
        match parent.child(msg.to_netnum) {
            Some(child) => child,
            None => {
                warn!(%addr, netnum = msg.to_netnum, "connect for unknown child net");
                return;
            }
        }
    };

    let from = msg.from_host.to_ascii_lowercase();
    if msg.to_host.to_ascii_lowercase() != mesh.my_name() || msg.to_port != mesh.my_port() {
        warn!(
            %addr,
            to_host = %msg.to_host,
            to_port = msg.to_port,
            "connect record names someone else, dropping"
        );
        return;
    }
    if from == mesh.my_name() {
        warn!(%addr, "connect claiming our own identity rejected");
        return;
    }
    if let Some(allow) = mesh.hook_allow() {
        if !allow(&from) {
            info!(%addr, %from, "connection refused by allow hook");
            return;
        }
    }

    let peer_requires_tls = msg.flags.contains(ConnectFlags::TLS);
    if peer_requires_tls || mesh.cfg.tls_policy == TlsPolicy::Require {
        if peer_requires_tls && mesh.cfg.tls_policy == TlsPolicy::Disabled {
            warn!(%from, "peer requires tls but local policy disables it");
            return;
        }
        let Some(tls) = mesh.hook_tls() else {
            warn!(%from, "tls handshake needed but no hook registered");
            return;
        };
        if let Err(err) = tls.accept(&sock) {
            warn!(%from, %err, "tls accept failed");
            return;
        }
    }

    let Ok((peer, _created)) = mesh.ensure_peer(&from, msg.from_port) else {
        return;
    };

    // replace any stale socket, waiting for its workers to let go
    peer.close_sock();
    let gone = || peer.ready_to_dial();
    sleep_unless(STALE_WORKER_WAIT, gone);
    if !gone() {
        warn!(peer = %peer.name, "stale workers still draining, dropping new connection");
        return;
    }

    let (rd, wr) = match (sock.try_clone(), sock.try_clone()) {
        (Ok(rd), Ok(wr)) => (rd, wr),
        _ => {
            warn!(peer = %peer.name, "could not clone accepted socket");
            return;
        }
    };
    match peer.install_sock(sock, None) {
        Ok(()) => {
            mesh.spawn_workers(&peer, rd, wr);
            // accept side greets too, so both directions learn the cluster
            if gossip::send_hello(&mesh, &peer, false).is_err() {
                debug!(peer = %peer.name, "hello enqueue on accepted socket failed");
            }
            mesh.start_connect_thread(&peer);
            info!(peer = %peer.name, %addr, "inbound mesh connection established");
        }
        Err(stale) => {
            debug!(peer = %peer.name, "lost install race with dial thread");
            drop(stale);
        }
    }
}
