//! Server network layer: listener, connection table, job producer
//!
//! Model thread:
//! - Satu network thread memanggil `get_jobs` berulang kali. Hanya thread
//!   ini yang menyentuh table, watch set, dan listener.
//! - Worker threads menerima `Arc<Connection>` di dalam job dan boleh
//!   memanggil callback-nya (terutama `close`) kapan saja.
//!
//! Menutup connection:
//! - `close` (dari worker atau dari receive yang gagal) men-shutdown socket,
//!   set state Closed, lalu push ke reclamation list. Belum ada yang di-free.
//! - Cycle berikutnya men-drain list, mengeluarkan connection dari table,
//!   dan mengembalikan satu `DelayedCall` yang men-drop batch tersebut.
//!   Dispatcher menjalankannya setelah semua job sebelumnya selesai, jadi
//!   tidak ada job yang masih memakai connection saat fd-nya ditutup.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::connection::{write_and_release, Connection, ConnectionCallbacks};
use super::job::{DelayedCall, Job};
use super::poller::{token_for, WatchSet, LISTENER};
use super::socket;
use super::table::ConnectionTable;
use crate::config::{Framing, ServerConfig};
use crate::core::{BufferPool, ReclaimBatch, ReclaimList};
use crate::error::{Result, TransportError};
use crate::protocol::{ChunkAssembler, MessageAssembler, PassThrough};

/// Endpoint url scheme
pub const SCHEME: &str = "opc.tcp://";

type DeleteList = ReclaimList<Arc<Connection>>;

/// Callbacks of accepted connections
struct ServerCallbacks {
    pool: BufferPool,
    // Weak: list -> connection -> callbacks -> list tidak boleh jadi cycle
    deletes: Weak<DeleteList>,
}

impl ConnectionCallbacks for ServerCallbacks {
    fn write(&self, conn: &Connection, buf: Vec<u8>) -> Result<()> {
        write_and_release(conn, &self.pool, buf)
    }

    fn close(&self, conn: &Arc<Connection>) {
        if !conn.begin_close() {
            return;
        }
        socket::shutdown(conn.stream());
        match self.deletes.upgrade() {
            Some(list) => {
                list.push(Arc::clone(conn));
                debug!(
                    conn = conn.id(),
                    fd = conn.fd(),
                    "connection closed, reclamation queued"
                );
            }
            // Layer sudah di-teardown; Arc terakhir yang menutup fd
            None => debug!(conn = conn.id(), "connection closed after teardown"),
        }
    }

    fn acquire_buffer(&self, conn: &Connection) -> Result<Vec<u8>> {
        self.pool.acquire(conn.send_chunk_size())
    }

    fn release_buffer(&self, _conn: &Connection, buf: Vec<u8>) {
        self.pool.release(buf)
    }
}

pub struct ServerNetworkLayer {
    config: ServerConfig,
    discovery_url: String,
    listener: Option<TcpListener>,
    watch: WatchSet,
    table: ConnectionTable,
    deletes: Arc<DeleteList>,
    callbacks: Arc<ServerCallbacks>,
    assembler: Arc<dyn MessageAssembler>,
}

impl ServerNetworkLayer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let watch = WatchSet::new().map_err(|e| TransportError::internal("poll setup", e))?;
        let deletes = Arc::new(DeleteList::new());
        let callbacks = Arc::new(ServerCallbacks {
            pool: BufferPool::new(config.buffer_policy),
            deletes: Arc::downgrade(&deletes),
        });
        let assembler: Arc<dyn MessageAssembler> = match config.framing {
            Framing::Raw => Arc::new(PassThrough),
            Framing::Chunked => Arc::new(ChunkAssembler::new(
                config.connection.max_message_size as usize,
            )),
        };
        let discovery_url = format!("{}{}:{}", SCHEME, socket::hostname(), config.port);

        Ok(Self {
            config,
            discovery_url,
            listener: None,
            watch,
            table: ConnectionTable::new(),
            deletes,
            callbacks,
            assembler,
        })
    }

    /// Replace the message assembler for connections accepted from now on
    pub fn with_assembler(mut self, assembler: Arc<dyn MessageAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn discovery_url(&self) -> &str {
        &self.discovery_url
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn contains(&self, connection: &Arc<Connection>) -> bool {
        self.table.contains(connection)
    }

    pub fn highest_watched_fd(&self) -> i32 {
        self.watch.highest_fd()
    }

    /// Bind and listen. Any socket failure is returned, nothing is kept.
    pub fn start(&mut self) -> Result<()> {
        if self.listener.is_some() {
            warn!(url = %self.discovery_url, "network layer already started");
            return Ok(());
        }

        let listener = socket::bind_listener(self.config.port, self.config.backlog)
            .map_err(|e| {
                warn!(port = self.config.port, error = %e, "Error during socket binding");
                TransportError::internal("bind", e)
            })?;

        self.watch
            .register(listener.as_raw_fd(), LISTENER)
            .map_err(|e| {
                warn!(error = %e, "Error registering listener");
                TransportError::internal("listener registration", e)
            })?;

        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.port);
        self.discovery_url = format!("{}{}:{}", SCHEME, socket::hostname(), port);
        self.listener = Some(listener);

        info!(url = %self.discovery_url, "Listening on {}", self.discovery_url);
        Ok(())
    }

    /// Track a new socket. Call only from the network thread.
    pub fn add(&mut self, stream: TcpStream) -> Result<Arc<Connection>> {
        let conn = Arc::new(Connection::new(
            stream,
            self.config.connection,
            Arc::clone(&self.assembler),
            self.callbacks.clone(),
        ));

        self.watch
            .register(conn.fd(), token_for(conn.fd()))
            .map_err(|e| TransportError::internal("connection registration", e))?;

        if let Err(e) = self.table.insert(Arc::clone(&conn)) {
            self.watch.deregister(conn.fd());
            return Err(e);
        }
        Ok(conn)
    }

    /// One poll cycle.
    ///
    /// Urutan: drain reclamation list -> rebuild watch set -> wait ->
    /// accept (maks satu) -> receive dari fd yang siap -> delayed free job
    /// (selalu terakhir).
    pub fn get_jobs(&mut self, timeout: Duration) -> Vec<Job> {
        self.produce_jobs(timeout, reserve_jobs)
    }

    /// Body of [`get_jobs`](Self::get_jobs). `reserve` allocates the job
    /// array; `None` means no memory.
    fn produce_jobs<F>(&mut self, timeout: Duration, reserve: F) -> Vec<Job>
    where
        F: FnOnce(usize) -> Option<Vec<Job>>,
    {
        let deletes = self.drain_deletes();

        let listener_fd = self.listener.as_ref().map(|l| l.as_raw_fd());
        self.watch.rebuild(listener_fd, &self.table);
        let mut ready = self.watch.wait(timeout);

        if listener_fd.is_some() && self.watch.is_ready(LISTENER) {
            ready -= 1;
            self.accept_one();
        }

        if deletes.is_empty() && ready <= 0 {
            return Vec::new();
        }
        let ready = ready.max(0) as usize;

        let Some(mut jobs) = reserve(ready + usize::from(!deletes.is_empty())) else {
            if !deletes.is_empty() {
                warn!(
                    pending = deletes.len(),
                    "no memory for jobs, retrying reclamation next cycle"
                );
                self.deletes.reattach(deletes);
            }
            return Vec::new();
        };

        let mut budget = ready;
        for entry in self.table.iter() {
            if budget == 0 {
                break;
            }
            if !self.watch.is_ready(token_for(entry.fd)) {
                continue;
            }
            budget -= 1;

            let conn = &entry.connection;
            // Sudah di-close worker; reclamation-nya menyusul cycle depan
            if conn.is_closed() {
                continue;
            }
            match conn.receive_from_socket(Duration::ZERO) {
                Ok(message) => jobs.push(Job::BinaryMessage {
                    connection: Arc::clone(conn),
                    message,
                }),
                Err(e) if e.is_recoverable() => {
                    trace!(conn = conn.id(), "nothing complete yet");
                }
                Err(e) => {
                    debug!(conn = conn.id(), error = %e, "receive failed, closing");
                    jobs.push(Job::CloseConnection(Arc::clone(conn)));
                }
            }
        }

        if !deletes.is_empty() {
            jobs.push(Job::DelayedCall(DelayedCall::new(
                "free_connections",
                move || {
                    free_connections(deletes);
                },
            )));
        }

        if !jobs.is_empty() {
            trace!(jobs = jobs.len(), "poll cycle");
        }
        jobs
    }

    /// Release the listener, then one `CloseConnection` job per open
    /// connection. Follow with [`teardown`](Self::teardown).
    pub fn stop(&mut self) -> Vec<Job> {
        self.close_all(reserve_jobs)
    }

    fn close_all<F>(&mut self, reserve: F) -> Vec<Job>
    where
        F: FnOnce(usize) -> Option<Vec<Job>>,
    {
        let deletes = self.drain_deletes();
        // Teardown yang mem-free; jangan sampai hilang di sini
        self.deletes.reattach(deletes);

        if let Some(listener) = self.listener.take() {
            self.watch.deregister(listener.as_raw_fd());
        }

        let Some(mut jobs) = reserve(self.table.len()) else {
            warn!(connections = self.table.len(), "no memory for close jobs");
            return Vec::new();
        };
        for entry in self.table.iter() {
            jobs.push(Job::CloseConnection(Arc::clone(&entry.connection)));
        }
        info!(connections = jobs.len(), "network layer stopped");
        jobs
    }

    /// Free every remaining connection and the layer itself. Run only
    /// after polling has stopped for good.
    pub fn teardown(mut self) {
        let freed = self.release_all();
        info!(freed, "network layer torn down");
    }

    fn accept_one(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = socket::configure_stream(&stream, true) {
                    warn!(%peer, error = %e, "failed to configure accepted socket");
                    return;
                }
                match self.add(stream) {
                    Ok(conn) => {
                        info!(conn = conn.id(), fd = conn.fd(), %peer, "accepted connection")
                    }
                    Err(e) => warn!(%peer, error = %e, "failed to add connection"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    fn drain_deletes(&mut self) -> ReclaimBatch<Arc<Connection>> {
        let deletes = self.deletes.take_all();
        if !deletes.is_empty() {
            let removed = self.table.remove_entries(&deletes, Some(&self.watch));
            debug!(drained = deletes.len(), removed, "reclamation list drained");
        }
        deletes
    }

    fn release_all(&mut self) -> usize {
        let mut freed = free_connections(self.drain_deletes());

        // Yang masih terbuka: close dulu supaya peer melihat EOF
        let remaining: Vec<_> = self.table.drain().map(|e| e.connection).collect();
        for conn in &remaining {
            self.watch.deregister(conn.fd());
            conn.close();
        }
        freed += free_connections(self.deletes.take_all());
        drop(remaining);

        if let Some(listener) = self.listener.take() {
            self.watch.deregister(listener.as_raw_fd());
        }
        self.callbacks.pool.clear();
        freed
    }
}

impl Drop for ServerNetworkLayer {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Job array for one cycle, `None` when the allocator refuses
fn reserve_jobs(count: usize) -> Option<Vec<Job>> {
    let mut jobs = Vec::new();
    jobs.try_reserve_exact(count).ok()?;
    Some(jobs)
}

/// Body of the delayed reclamation job
fn free_connections(batch: ReclaimBatch<Arc<Connection>>) -> usize {
    let count = batch.len();
    for conn in &batch {
        trace!(conn = conn.id(), fd = conn.fd(), "freeing connection");
    }
    drop(batch);
    if count > 0 {
        debug!(count, "connections freed");
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::tests::stream_pair;
    use std::io::Write;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    fn run_delayed(jobs: Vec<Job>) -> usize {
        let mut ran = 0;
        for job in jobs {
            if let Job::DelayedCall(call) = job {
                call.run();
                ran += 1;
            }
        }
        ran
    }

    #[test]
    fn test_add_close_cycle_frees_connection() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        let (_peer, server) = stream_pair();
        server.set_nonblocking(true).unwrap();

        let before = layer.connection_count();
        let conn = layer.add(server).unwrap();
        assert_eq!(layer.connection_count(), before + 1);

        conn.close();
        let jobs = layer.get_jobs(Duration::from_millis(1));

        // Out of the table before the watch set was rebuilt
        assert!(!layer.contains(&conn));
        assert_eq!(layer.connection_count(), before);
        assert_eq!(jobs.len(), 1);
        assert!(jobs.last().unwrap().is_delayed());

        // Layer no longer references it; the delayed job holds the last copy
        assert_eq!(Arc::strong_count(&conn), 2);
        assert_eq!(run_delayed(jobs), 1);
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn test_double_close_enqueues_once() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        let (_peer, server) = stream_pair();
        let conn = layer.add(server).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || conn.close())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        conn.close();

        assert_eq!(layer.deletes.take_all().len(), 1);
    }

    #[test]
    fn test_delayed_job_is_last() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        let (_peer_a, a) = stream_pair();
        let (mut peer_b, b) = stream_pair();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let conn_a = layer.add(a).unwrap();
        let conn_b = layer.add(b).unwrap();
        peer_b.write_all(b"data").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        conn_a.close();

        let jobs = layer.get_jobs(Duration::from_millis(200));
        assert_eq!(jobs.len(), 2);
        match &jobs[0] {
            Job::BinaryMessage {
                connection,
                message,
            } => {
                assert!(Arc::ptr_eq(connection, &conn_b));
                assert_eq!(message, b"data");
            }
            other => panic!("unexpected job {:?}", other),
        }
        assert!(jobs[1].is_delayed());
        assert_eq!(layer.connection_count(), 1);
    }

    #[test]
    fn test_stop_then_teardown_releases_everything() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        layer.start().unwrap();

        let mut held = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (peer, server) = stream_pair();
            held.push(layer.add(server).unwrap());
            peers.push(peer);
        }

        let jobs = layer.stop();
        assert_eq!(jobs.len(), 3);
        assert!(layer.local_addr().is_none());
        for job in jobs {
            match job {
                Job::CloseConnection(conn) => conn.close(),
                other => panic!("unexpected job {:?}", other),
            }
        }

        layer.teardown();
        for conn in &held {
            assert!(conn.is_closed());
            assert_eq!(Arc::strong_count(conn), 1);
        }
    }

    #[test]
    fn test_start_sets_discovery_url() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        layer.start().unwrap();
        let port = layer.local_addr().unwrap().port();

        assert!(layer.discovery_url().starts_with(SCHEME));
        assert!(layer.discovery_url().ends_with(&format!(":{}", port)));
    }

    #[test]
    fn test_start_on_busy_port_fails() {
        let busy = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let mut layer = ServerNetworkLayer::new(ServerConfig {
            port,
            ..ServerConfig::default()
        })
        .unwrap();
        let err = layer.start().unwrap_err();
        assert!(matches!(err, TransportError::InternalError { .. }));
        assert!(layer.local_addr().is_none());
    }

    #[test]
    fn test_close_after_teardown_is_harmless() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        let (_peer, server) = stream_pair();
        let conn = layer.add(server).unwrap();
        let extra = Arc::clone(&conn);
        drop(layer);

        // Already closed by teardown; a late close from a worker is a no-op
        extra.close();
        assert!(extra.is_closed());
        drop(conn);
        assert_eq!(Arc::strong_count(&extra), 1);
    }

    #[test]
    fn test_job_alloc_failure_keeps_reclamation() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        let (_peer, server) = stream_pair();
        let conn = layer.add(server).unwrap();
        conn.close();

        let jobs = layer.produce_jobs(Duration::from_millis(1), |_| None);
        assert!(jobs.is_empty());
        assert_eq!(layer.connection_count(), 0);

        // Batch went back to the list instead of being dropped
        assert!(!layer.deletes.is_empty());
        assert_eq!(Arc::strong_count(&conn), 2);

        let jobs = layer.get_jobs(Duration::from_millis(1));
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_delayed());
        assert!(layer.deletes.is_empty());
        assert_eq!(run_delayed(jobs), 1);
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn test_stop_releases_listener_without_memory() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        layer.start().unwrap();
        let port = layer.local_addr().unwrap().port();
        let (_peer, server) = stream_pair();
        let conn = layer.add(server).unwrap();

        let jobs = layer.close_all(|_| None);
        assert!(jobs.is_empty());
        assert!(layer.local_addr().is_none());
        // Port is free again
        TcpListener::bind(("0.0.0.0", port)).unwrap();

        layer.teardown();
        assert!(conn.is_closed());
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn test_with_assembler_frames_accepted_connections() {
        let mut layer = ServerNetworkLayer::new(test_config())
            .unwrap()
            .with_assembler(Arc::new(ChunkAssembler::new(1024)));
        let (mut peer, server) = stream_pair();
        server.set_nonblocking(true).unwrap();
        layer.add(server).unwrap();

        let chunk = crate::protocol::encode_chunk(*b"MSG", b"framed").unwrap();
        peer.write_all(&chunk[..5]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(layer.get_jobs(Duration::from_millis(100)).is_empty());

        peer.write_all(&chunk[5..]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let jobs = layer.get_jobs(Duration::from_millis(200));
        match jobs.as_slice() {
            [Job::BinaryMessage { message, .. }] => assert_eq!(message, &chunk),
            other => panic!("unexpected jobs {:?}", other),
        }
    }

    #[test]
    fn test_highest_watched_fd_tracks_table() {
        let mut layer = ServerNetworkLayer::new(test_config()).unwrap();
        layer.start().unwrap();
        let listener_fd = layer.listener.as_ref().unwrap().as_raw_fd();

        layer.get_jobs(Duration::from_millis(1));
        assert_eq!(layer.highest_watched_fd(), listener_fd);

        let (_peer, server) = stream_pair();
        let conn = layer.add(server).unwrap();
        layer.get_jobs(Duration::from_millis(1));
        assert_eq!(layer.highest_watched_fd(), listener_fd.max(conn.fd()));

        conn.close();
        layer.get_jobs(Duration::from_millis(1));
        assert_eq!(layer.highest_watched_fd(), listener_fd);
    }
}
