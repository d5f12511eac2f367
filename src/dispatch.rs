//! Reference job dispatcher
//!
//! Menjalankan job dari `ServerNetworkLayer::get_jobs` di worker pool dan
//! menjaga kontrak urutan `DelayedCall`:
//!
//! - Setiap job biasa mendapat sequence number yang naik terus.
//! - `DelayedCall` yang masuk saat sequence berikutnya = `t` baru dijalankan
//!   setelah tidak ada lagi job dengan sequence `< t` yang outstanding.
//! - Job yang datang belakangan tidak menahan delayed call yang lebih dulu.
//!
//! Dengan 0 worker semua job dijalankan inline di thread pemanggil.

use std::collections::{BTreeSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::network::{Connection, DelayedCall, Job};

/// Server-side handling of the two connection-bearing job kinds
pub trait JobHandler: Send + Sync + 'static {
    fn on_message(&self, connection: &Arc<Connection>, message: Vec<u8>);

    /// Peer hilang atau receive gagal. Default: tutup connection.
    fn on_close(&self, connection: &Arc<Connection>) {
        connection.close();
    }
}

struct Task {
    seq: u64,
    job: Job,
}

/// Sequence numbers of jobs handed out but not finished yet
#[derive(Default)]
struct Outstanding {
    pending: Mutex<BTreeSet<u64>>,
    finished: Condvar,
}

impl Outstanding {
    fn begin(&self, seq: u64) {
        self.lock().insert(seq);
    }

    fn finish(&self, seq: u64) {
        self.lock().remove(&seq);
        self.finished.notify_all();
    }

    /// True when no job older than `barrier` is still running
    fn clear_before(&self, barrier: u64) -> bool {
        self.lock().first().map_or(true, |&oldest| oldest >= barrier)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn wait_empty(&self) {
        let mut pending = self.lock();
        while !pending.is_empty() {
            pending = self
                .finished
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a job finished even if the handler panics
struct FinishGuard<'a> {
    outstanding: &'a Outstanding,
    seq: u64,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.outstanding.finish(self.seq);
    }
}

pub struct Dispatcher<H: JobHandler> {
    handler: Arc<H>,
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    outstanding: Arc<Outstanding>,
    next_seq: u64,
    delayed: VecDeque<(u64, DelayedCall)>,
}

impl<H: JobHandler> Dispatcher<H> {
    pub fn new(handler: H, workers: usize) -> Self {
        let handler = Arc::new(handler);
        let outstanding = Arc::new(Outstanding::default());

        let (sender, handles) = if workers == 0 {
            (None, Vec::new())
        } else {
            let (tx, rx) = mpsc::channel::<Task>();
            let rx = Arc::new(Mutex::new(rx));
            let handles = (0..workers)
                .map(|i| {
                    let rx = Arc::clone(&rx);
                    let handler = Arc::clone(&handler);
                    let outstanding = Arc::clone(&outstanding);
                    thread::Builder::new()
                        .name(format!("netlayer-worker-{}", i))
                        .spawn(move || worker_loop(rx, handler, outstanding))
                })
                .filter_map(|spawned| match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "failed to spawn worker");
                        None
                    }
                })
                .collect::<Vec<_>>();
            if handles.is_empty() {
                (None, handles)
            } else {
                (Some(tx), handles)
            }
        };
        debug!(workers = handles.len(), "dispatcher ready");

        Self {
            handler,
            sender,
            workers: handles,
            outstanding,
            next_seq: 0,
            delayed: VecDeque::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs handed to workers and not finished yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Delayed calls still waiting for older jobs
    pub fn delayed_pending(&self) -> usize {
        self.delayed.len()
    }

    /// Hand over one cycle's jobs, then run whatever delayed calls are
    /// already unblocked.
    pub fn dispatch(&mut self, jobs: Vec<Job>) {
        for job in jobs {
            match job {
                Job::DelayedCall(call) => {
                    trace!(name = call.name(), barrier = self.next_seq, "delayed call queued");
                    self.delayed.push_back((self.next_seq, call));
                }
                job => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.submit(Task { seq, job });
                }
            }
        }
        self.run_ready_delayed();
    }

    /// Run queued delayed calls whose barrier has been passed, in order.
    /// Returns how many ran.
    pub fn run_ready_delayed(&mut self) -> usize {
        let mut ran = 0;
        while let Some(&(barrier, _)) = self.delayed.front() {
            if !self.outstanding.clear_before(barrier) {
                break;
            }
            if let Some((_, call)) = self.delayed.pop_front() {
                trace!(name = call.name(), barrier, "running delayed call");
                call.run();
                ran += 1;
            }
        }
        ran
    }

    /// Wait for every outstanding job, then run all delayed calls
    pub fn drain(&mut self) {
        self.outstanding.wait_empty();
        let ran = self.run_ready_delayed();
        if ran > 0 {
            debug!(ran, "delayed calls drained");
        }
    }

    /// Drain, then stop and join the workers
    pub fn shutdown(mut self) {
        self.drain();
        self.stop_workers();
    }

    fn submit(&self, task: Task) {
        self.outstanding.begin(task.seq);
        let task = match &self.sender {
            Some(tx) => match tx.send(task) {
                Ok(()) => return,
                // Semua worker mati; jalankan di sini saja
                Err(mpsc::SendError(task)) => task,
            },
            None => task,
        };
        execute(&*self.handler, &self.outstanding, task);
    }

    fn stop_workers(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker panicked");
            }
        }
    }
}

impl<H: JobHandler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        self.drain();
        self.stop_workers();
    }
}

fn worker_loop<H: JobHandler>(
    rx: Arc<Mutex<Receiver<Task>>>,
    handler: Arc<H>,
    outstanding: Arc<Outstanding>,
) {
    loop {
        let task = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match task {
            Ok(task) => execute(&*handler, &outstanding, task),
            Err(_) => break,
        }
    }
}

fn execute<H: JobHandler>(handler: &H, outstanding: &Outstanding, task: Task) {
    let _guard = FinishGuard {
        outstanding,
        seq: task.seq,
    };
    match task.job {
        Job::BinaryMessage {
            connection,
            message,
        } => handler.on_message(&connection, message),
        Job::CloseConnection(connection) => handler.on_close(&connection),
        // Tidak pernah di-submit; ditangani di dispatch
        Job::DelayedCall(call) => call.run(),
    }
}
