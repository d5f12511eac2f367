//! Socket primitives
//!
//! Dipakai oleh callback setiap connection. Semua fungsi bekerja di atas
//! `std::net::TcpStream` yang dipinjam; fd sendiri baru ditutup ketika
//! stream di-drop (oleh reclamation job).

use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Blocking send loop. Retries on interrupt and would-block.
pub fn send_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    let mut stream = stream;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Failed to write to socket",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One receive call, waiting at most `timeout`.
///
/// Zero timeout = jangan block sama sekali (MSG_DONTWAIT), karena
/// SO_RCVTIMEO 0 berarti "tunggu selamanya".
pub fn recv_timed(stream: &TcpStream, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let flags = if timeout.is_zero() {
        libc::MSG_DONTWAIT
    } else {
        SockRef::from(stream).set_read_timeout(Some(timeout))?;
        0
    };

    // SAFETY: buf valid untuk buf.len() bytes selama panggilan
    let n = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Timeout-class errors leave the socket usable
#[inline]
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Non-blocking + TCP_NODELAY, sekali saat accept/connect
pub fn configure_stream(stream: &TcpStream, nonblocking: bool) -> io::Result<()> {
    stream.set_nonblocking(nonblocking)?;
    stream.set_nodelay(true)?;
    Ok(())
}

/// Abrupt shutdown of both directions. Peer sees EOF right away.
pub fn shutdown(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::debug!(fd = stream.as_raw_fd(), error = %e, "shutdown failed");
        }
    }
}

/// IPv4 listener on all interfaces with SO_REUSEADDR, non-blocking
pub fn bind_listener(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Hostname mesin ini, untuk discovery url
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buffer 256 bytes, kita berikan 255 supaya selalu ada NUL
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_send_all_then_recv() {
        let (client, server) = pair();
        send_all(&client, b"hello network layer").unwrap();

        let mut buf = [0u8; 64];
        let n = recv_timed(&server, &mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..n], b"hello network layer");
    }

    #[test]
    fn test_recv_zero_timeout_would_block() {
        let (_client, server) = pair();
        let mut buf = [0u8; 16];
        let err = recv_timed(&server, &mut buf, Duration::ZERO).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (_client, server) = pair();
        let mut buf = [0u8; 16];
        let err = recv_timed(&server, &mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_shutdown_gives_peer_eof() {
        let (mut client, server) = pair();
        shutdown(&server);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        // Second shutdown is harmless
        shutdown(&server);
    }

    #[test]
    fn test_bind_listener_ephemeral() {
        let listener = bind_listener(0, 100).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }
}
