//! Connection handle
//!
//! Satu `Connection` = satu TCP socket. Identitas = fd, stabil selama
//! hidupnya. State hanya bergerak maju: Opening -> Open -> Closed.
//!
//! `close` tidak pernah mem-free apa pun. Socket di-shutdown, state jadi
//! Closed, dan connection diserahkan ke reclamation list. Fd baru benar-benar
//! ditutup saat `Arc` terakhir di-drop, yaitu di dalam delayed job.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, trace};

use super::socket;
use crate::config::ConnectionConfig;
use crate::core::{alloc_zeroed, BufferPool};
use crate::error::{Result, TransportError};
use crate::protocol::MessageAssembler;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Opening = 1,
    Open = 2,
    Closed = 3,
}

impl ConnectionState {
    #[inline(always)]
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Opening,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Capability set of a connection.
///
/// Server-side and client-side connections differ only here.
pub trait ConnectionCallbacks: Send + Sync {
    /// Send all of `buf`. The buffer goes back to its pool afterwards.
    fn write(&self, conn: &Connection, buf: Vec<u8>) -> Result<()>;

    /// Idempotent. Only the first caller does any work.
    fn close(&self, conn: &Arc<Connection>);

    /// Buffer sized for one outgoing chunk to the peer
    fn acquire_buffer(&self, conn: &Connection) -> Result<Vec<u8>>;

    fn release_buffer(&self, conn: &Connection, buf: Vec<u8>);

    fn receive(&self, conn: &Arc<Connection>, timeout: Duration) -> Result<Vec<u8>> {
        let _ = (conn, timeout);
        Err(TransportError::Unsupported("receive"))
    }
}

pub struct Connection {
    id: u64,
    fd: RawFd,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    local_conf: ConnectionConfig,
    remote_conf: RwLock<ConnectionConfig>,
    // Trailing partial message dari receive sebelumnya
    incomplete: Mutex<Vec<u8>>,
    assembler: Arc<dyn MessageAssembler>,
    callbacks: Arc<dyn ConnectionCallbacks>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        local_conf: ConnectionConfig,
        assembler: Arc<dyn MessageAssembler>,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            fd: stream.as_raw_fd(),
            peer: stream.peer_addr().ok(),
            stream,
            state: AtomicU8::new(ConnectionState::Opening as u8),
            local_conf,
            // Sampai negosiasi selesai, anggap peer sama dengan kita
            remote_conf: RwLock::new(local_conf),
            incomplete: Mutex::new(Vec::new()),
            assembler,
            callbacks,
        }
    }

    /// Process-unique id, for logs
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline(always)]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Opening -> Open. False if the connection was already open or closed.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Opening as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn local_config(&self) -> ConnectionConfig {
        self.local_conf
    }

    pub fn remote_config(&self) -> ConnectionConfig {
        *self
            .remote_conf
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the limits negotiated with the peer
    pub fn set_remote_config(&self, conf: ConnectionConfig) {
        *self
            .remote_conf
            .write()
            .unwrap_or_else(PoisonError::into_inner) = conf;
    }

    pub fn write(&self, buf: Vec<u8>) -> Result<()> {
        self.callbacks.write(self, buf)
    }

    pub fn close(self: &Arc<Self>) {
        let callbacks = Arc::clone(&self.callbacks);
        callbacks.close(self);
    }

    pub fn acquire_buffer(&self) -> Result<Vec<u8>> {
        self.callbacks.acquire_buffer(self)
    }

    pub fn release_buffer(&self, buf: Vec<u8>) {
        self.callbacks.release_buffer(self, buf)
    }

    pub fn receive(self: &Arc<Self>, timeout: Duration) -> Result<Vec<u8>> {
        let callbacks = Arc::clone(&self.callbacks);
        callbacks.receive(self, timeout)
    }

    /// Atomic transition ke Closed. True hanya untuk satu pemanggil.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            != ConnectionState::Closed as u8
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Size of one outgoing chunk the peer accepts
    pub(crate) fn send_chunk_size(&self) -> usize {
        let remote = self.remote_config().recv_buffer_size;
        if remote > 0 {
            remote as usize
        } else {
            self.local_conf.send_buffer_size as usize
        }
    }

    /// Receive one span and run it through the message assembler.
    ///
    /// EOF or a hard socket error closes the connection. A timeout, or a
    /// span that completes nothing yet, is `CommunicationTimeout`.
    pub(crate) fn receive_from_socket(self: &Arc<Self>, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = alloc_zeroed(self.local_conf.recv_buffer_size as usize)?;

        let n = match socket::recv_timed(&self.stream, &mut buf, timeout) {
            Ok(0) => {
                debug!(conn = self.id, fd = self.fd, "peer closed connection");
                self.close();
                return Err(TransportError::ConnectionClosed);
            }
            Ok(n) => n,
            Err(ref e) if socket::is_timeout(e) => {
                return Err(TransportError::CommunicationTimeout);
            }
            Err(e) => {
                debug!(conn = self.id, fd = self.fd, error = %e, "receive failed");
                self.close();
                return Err(TransportError::ConnectionClosed);
            }
        };
        buf.truncate(n);
        trace!(conn = self.id, bytes = n, "received");

        let assembled = {
            let mut pending = self
                .incomplete
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.assembler.complete_messages(&mut pending, buf)
        };

        match assembled {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::CommunicationTimeout),
            Err(e) => {
                debug!(conn = self.id, error = %e, "dropping connection with bad framing");
                self.close();
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Write path shared by both callback variants
pub(crate) fn write_and_release(conn: &Connection, pool: &BufferPool, buf: Vec<u8>) -> Result<()> {
    let result = if conn.is_closed() {
        Err(TransportError::ConnectionClosed)
    } else {
        socket::send_all(conn.stream(), &buf).map_err(|e| {
            debug!(conn = conn.id(), error = %e, "send failed");
            TransportError::ConnectionClosed
        })
    };
    pool.release(buf);
    result
}
