use std::{
    io,
    net::{SocketAddr, TcpStream},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd},
    time::{Duration, Instant},
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use tracing::debug;

const TOKEN: Token = Token(0);

/// Baseline socket options for anything we accept or dial: no Nagle,
/// keepalive, optionally large kernel buffers.
pub(crate) fn set_mesh_sockopts(sock: &TcpStream, buf_size: usize) -> io::Result<()> {
    sock.set_nodelay(true)?;
    let fd = sock.as_raw_fd();
    unsafe {
        let on: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&raw const on).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        if buf_size > 0 {
            let size = buf_size as libc::c_int;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const size).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                (&raw const size).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    Ok(())
}

/// Zero-linger for mesh peer sockets only, so a torn-down connection frees
/// its port immediately. Appsocks are spared: the host owns their
/// lifecycle, and a reset would eat the last reply.
pub(crate) fn set_linger_zero(sock: &TcpStream) {
    let fd = sock.as_raw_fd();
    unsafe {
        let linger = libc::linger { l_onoff: 1, l_linger: 0 };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast(),
            size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

/// Peek one byte without consuming it. `Ok(None)` means orderly EOF before
/// any byte arrived.
pub(crate) fn peek_byte(sock: &TcpStream) -> io::Result<Option<u8>> {
    let mut byte = 0u8;
    let n = unsafe {
        libc::recv(sock.as_raw_fd(), (&raw mut byte).cast(), 1, libc::MSG_PEEK)
    };
    match n {
        1 => Ok(Some(byte)),
        0 => Ok(None),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Wait up to `timeout` for the socket to become readable.
pub(crate) fn wait_readable(sock: &TcpStream, timeout: Duration) -> io::Result<bool> {
    let fd = sock.as_raw_fd();
    let mut poll = Poll::new()?;
    poll.registry().register(&mut SourceFd(&fd), TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(4);
    poll.poll(&mut events, Some(timeout))?;
    Ok(!events.is_empty())
}

/// Non-blocking connect with a bounded writability wait, returning a
/// blocking stream ready for the handshake. Any error or timeout maps to a
/// plain `io::Error`; the dial loop just retries.
pub(crate) fn connect_bounded(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let mut stream = mio::net::TcpStream::connect(addr)?;
    let mut poll = Poll::new()?;
    poll.registry().register(&mut stream, TOKEN, Interest::WRITABLE)?;

    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + timeout;
    loop {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        };
        poll.poll(&mut events, Some(left))?;
        if events.iter().any(|e| e.token() == TOKEN) {
            break;
        }
    }

    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    // writable + no SO_ERROR, but confirm the 3-way handshake finished
    match stream.peer_addr() {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect incomplete"));
        }
        Err(e) => return Err(e),
    }

    poll.registry().deregister(&mut stream)?;
    let sock = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
    sock.set_nonblocking(false)?;
    debug!(%addr, "connected");
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connect_bounded_reaches_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = connect_bounded(addr, Duration::from_millis(100)).unwrap();
        assert_eq!(sock.peer_addr().unwrap(), addr);
    }

    #[test]
    fn connect_bounded_fails_fast_on_refused() {
        // bind then drop to get a port with nothing listening
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let t0 = Instant::now();
        assert!(connect_bounded(addr, Duration::from_millis(100)).is_err());
        assert!(t0.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn peek_does_not_consume() {
        use std::io::{Read, Write};
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.write_all(b"xy").unwrap();
        client.flush().unwrap();

        assert!(wait_readable(&server, Duration::from_secs(2)).unwrap());
        assert_eq!(peek_byte(&server).unwrap(), Some(b'x'));
        let mut buf = [0u8; 2];
        let mut server = server;
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"xy");
        drop(client);
    }
}
