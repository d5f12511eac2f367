//! Client connect path
//!
//! Tidak ada network layer di sisi client: connection langsung memegang
//! buffer pool-nya sendiri, dan `receive` dipanggil sinkron oleh pemakai.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::connection::{write_and_release, Connection, ConnectionCallbacks};
use super::server::SCHEME;
use super::socket;
use crate::config::{BufferPolicy, ConnectionConfig};
use crate::core::BufferPool;
use crate::error::{Result, TransportError};
use crate::protocol::{MessageAssembler, PassThrough};

pub const MIN_URL_LEN: usize = 11;
pub const MAX_URL_LEN: usize = 511;

/// Host and port taken from `opc.tcp://host:port[/path]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Validate an endpoint url. No syscalls.
pub fn parse_endpoint(url: &str) -> Result<Endpoint> {
    if url.len() < MIN_URL_LEN || url.len() > MAX_URL_LEN {
        return Err(TransportError::InvalidEndpoint(format!(
            "url length {} outside {}..={}",
            url.len(),
            MIN_URL_LEN,
            MAX_URL_LEN
        )));
    }
    let Some(rest) = url.strip_prefix(SCHEME) else {
        return Err(TransportError::InvalidEndpoint(format!(
            "url does not begin with {}",
            SCHEME
        )));
    };

    // Colon pertama setelah scheme memisahkan host dan port
    let Some(colon) = rest.find(':') else {
        return Err(TransportError::InvalidEndpoint("port missing".into()));
    };
    let host = &rest[..colon];
    if host.is_empty() {
        return Err(TransportError::InvalidEndpoint("host missing".into()));
    }

    let digits: &str = {
        let after = &rest[colon + 1..];
        let end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        &after[..end]
    };
    let port = match digits.parse::<u16>() {
        Ok(p) if p != 0 => p,
        _ => return Err(TransportError::InvalidEndpoint("port invalid".into())),
    };

    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}

/// First IPv4 address of the endpoint
fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| {
            debug!(host = %endpoint.host, error = %e, "lookup error");
            TransportError::HostResolution(endpoint.host.clone())
        })?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TransportError::HostResolution(endpoint.host.clone()))
}

struct ClientCallbacks {
    pool: BufferPool,
}

impl ConnectionCallbacks for ClientCallbacks {
    fn write(&self, conn: &Connection, buf: Vec<u8>) -> Result<()> {
        write_and_release(conn, &self.pool, buf)
    }

    fn close(&self, conn: &Arc<Connection>) {
        if !conn.begin_close() {
            return;
        }
        socket::shutdown(conn.stream());
        self.pool.clear();
        debug!(conn = conn.id(), "client connection closed");
    }

    fn acquire_buffer(&self, conn: &Connection) -> Result<Vec<u8>> {
        self.pool.acquire(conn.send_chunk_size())
    }

    fn release_buffer(&self, _conn: &Connection, buf: Vec<u8>) {
        self.pool.release(buf)
    }

    fn receive(&self, conn: &Arc<Connection>, timeout: Duration) -> Result<Vec<u8>> {
        conn.receive_from_socket(timeout)
    }
}

/// Open a connection to `opc.tcp://host:port`.
///
/// Returns a connection in the Opening state. Every failure returns an
/// error and leaves no socket behind.
pub fn connect(config: ConnectionConfig, endpoint_url: &str) -> Result<Arc<Connection>> {
    connect_with(config, endpoint_url, BufferPolicy::Reuse, Arc::new(PassThrough))
}

pub fn connect_with(
    config: ConnectionConfig,
    endpoint_url: &str,
    buffer_policy: BufferPolicy,
    assembler: Arc<dyn MessageAssembler>,
) -> Result<Arc<Connection>> {
    let endpoint = parse_endpoint(endpoint_url).map_err(|e| {
        warn!(url = endpoint_url, error = %e, "Server url invalid");
        e
    })?;

    let addr = resolve(&endpoint).map_err(|e| {
        warn!(host = %endpoint.host, "DNS lookup of {} failed", endpoint.host);
        e
    })?;

    let stream = TcpStream::connect(addr).map_err(|e| {
        warn!(%addr, error = %e, "Connection failed");
        TransportError::ConnectFailed(e)
    })?;
    // Client tetap blocking; receive memakai timeout per panggilan
    socket::configure_stream(&stream, false)
        .map_err(|e| TransportError::internal("socket options", e))?;

    let callbacks = Arc::new(ClientCallbacks {
        pool: BufferPool::new(buffer_policy),
    });
    let conn = Arc::new(Connection::new(stream, config, assembler, callbacks));
    info!(conn = conn.id(), %addr, "connected");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionState;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_parse_basic() {
        let ep = parse_endpoint("opc.tcp://localhost:4840").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 4840);
    }

    #[test]
    fn test_parse_ignores_path() {
        let ep = parse_endpoint("opc.tcp://10.0.0.1:48010/UA/Server").unwrap();
        assert_eq!(ep.host, "10.0.0.1");
        assert_eq!(ep.port, 48010);
    }

    #[test]
    fn test_parse_rejects_wrong_scheme() {
        let err = parse_endpoint("http://host:1").unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_parse_length_bounds() {
        assert!(parse_endpoint("opc.tcp://").is_err());
        assert!(parse_endpoint("opc.tcp://a").is_err()); // 11 chars but no port

        let long = format!("opc.tcp://{}:4840", "h".repeat(MAX_URL_LEN));
        assert!(matches!(
            parse_endpoint(&long).unwrap_err(),
            TransportError::InvalidEndpoint(_)
        ));
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        for url in [
            "opc.tcp://host:0",
            "opc.tcp://host:",
            "opc.tcp://host:abc",
            "opc.tcp://host:70000",
            "opc.tcp://hostonly",
            "opc.tcp://:4840",
        ] {
            assert!(parse_endpoint(url).is_err(), "{} should be rejected", url);
        }
    }

    #[test]
    fn test_connect_write_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = connect(
            ConnectionConfig::default(),
            &format!("opc.tcp://127.0.0.1:{}", port),
        )
        .unwrap();
        assert_eq!(conn.state(), ConnectionState::Opening);

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = conn.acquire_buffer().unwrap();
        buf.truncate(5);
        buf.copy_from_slice(b"hello");
        conn.write(buf).unwrap();

        let mut got = [0u8; 5];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");

        server.write_all(b"world").unwrap();
        let reply = conn.receive(Duration::from_millis(500)).unwrap();
        assert_eq!(reply, b"world");

        // Nothing more: recoverable timeout, connection untouched
        let err = conn.receive(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!conn.is_closed());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(server.read(&mut got).unwrap(), 0);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = connect(
            ConnectionConfig::default(),
            &format!("opc.tcp://127.0.0.1:{}", port),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed(_)));
    }
}
