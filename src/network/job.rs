//! Jobs: unit of work dari network layer ke dispatcher
//!
//! Setiap job dikonsumsi tepat sekali. `DelayedCall` wajib dijalankan
//! setelah semua job yang dikeluarkan sebelumnya selesai.

use std::fmt;
use std::sync::Arc;

use super::Connection;

pub enum Job {
    /// Bytes received on a connection
    BinaryMessage {
        connection: Arc<Connection>,
        message: Vec<u8>,
    },
    /// The connection failed or the peer went away; the dispatcher
    /// should clean up and call `close`.
    CloseConnection(Arc<Connection>),
    /// Runs only after every earlier job has finished
    DelayedCall(DelayedCall),
}

impl Job {
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Job::BinaryMessage { connection, .. } => Some(connection),
            Job::CloseConnection(connection) => Some(connection),
            Job::DelayedCall(_) => None,
        }
    }

    #[inline]
    pub fn is_delayed(&self) -> bool {
        matches!(self, Job::DelayedCall(_))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::BinaryMessage {
                connection,
                message,
            } => f
                .debug_struct("BinaryMessage")
                .field("conn", &connection.id())
                .field("len", &message.len())
                .finish(),
            Job::CloseConnection(connection) => f
                .debug_tuple("CloseConnection")
                .field(&connection.id())
                .finish(),
            Job::DelayedCall(call) => f.debug_tuple("DelayedCall").field(&call.name).finish(),
        }
    }
}

/// Deferred function plus the data it owns
pub struct DelayedCall {
    name: &'static str,
    call: Box<dyn FnOnce() + Send>,
}

impl DelayedCall {
    pub fn new<F>(name: &'static str, call: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name,
            call: Box::new(call),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(self) {
        (self.call)()
    }
}

impl fmt::Debug for DelayedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedCall")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_delayed_call_runs_once_owned() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let job = Job::DelayedCall(DelayedCall::new("set_flag", move || {
            flag.store(true, Ordering::SeqCst);
        }));

        assert!(job.is_delayed());
        assert!(job.connection().is_none());
        assert_eq!(format!("{:?}", job), "DelayedCall(\"set_flag\")");

        if let Job::DelayedCall(call) = job {
            call.run();
        }
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(Arc::strong_count(&ran), 1);
    }
}
