//! Readiness multiplexer
//!
//! mio (epoll/kqueue) di bawahnya edge-triggered. Setiap cycle semua fd
//! di-reregister, sehingga fd yang masih punya data atau EOF dilaporkan
//! lagi meskipun receive sebelumnya tidak menghabiskan socket buffer.
//! Hasilnya: setiap cycle melihat set "siap" yang segar, sama seperti
//! select yang input set-nya dikonsumsi.

use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use super::table::ConnectionTable;

pub const LISTENER: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

#[inline(always)]
pub fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

pub struct WatchSet {
    poll: Poll,
    events: Events,
    ready: HashSet<Token>,
    highest_fd: RawFd,
}

impl WatchSet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: HashSet::new(),
            highest_fd: -1,
        })
    }

    pub fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Best effort; the fd is going away anyway
    pub fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!(fd, error = %e, "deregister failed");
        }
    }

    /// Re-arm the listener and every table entry for this cycle.
    pub fn rebuild(&mut self, listener: Option<RawFd>, table: &ConnectionTable) {
        self.highest_fd = -1;
        let registry = self.poll.registry();

        if let Some(fd) = listener {
            if let Err(e) = registry.reregister(&mut SourceFd(&fd), LISTENER, Interest::READABLE) {
                warn!(fd, error = %e, "failed to re-arm listener");
            }
            self.highest_fd = fd;
        }

        for entry in table.iter() {
            let fd = entry.fd;
            if let Err(e) =
                registry.reregister(&mut SourceFd(&fd), token_for(fd), Interest::READABLE)
            {
                debug!(fd, error = %e, "failed to re-arm connection");
            }
            self.highest_fd = self.highest_fd.max(fd);
        }
    }

    /// Block up to `timeout`. Returns the number of ready descriptors,
    /// -1 on interrupt or poll failure.
    pub fn wait(&mut self, timeout: Duration) -> isize {
        self.ready.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {
                for event in self.events.iter() {
                    self.ready.insert(event.token());
                }
                self.ready.len() as isize
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => -1,
            Err(e) => {
                warn!(error = %e, "poll failed");
                -1
            }
        }
    }

    #[inline]
    pub fn is_ready(&self, token: Token) -> bool {
        self.ready.contains(&token)
    }

    /// Highest fd watched in the current cycle, -1 if none
    #[inline]
    pub fn highest_fd(&self) -> RawFd {
        self.highest_fd
    }
}
