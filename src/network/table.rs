//! Connection table: fd -> connection
//!
//! Hanya network thread yang boleh menyentuh table ini. Fd disimpan
//! duplikat di entry supaya pencarian tidak perlu membaca connection yang
//! mungkin sedang di-close oleh worker lain.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::trace;

use super::poller::WatchSet;
use super::Connection;
use crate::core::ReclaimBatch;
use crate::error::{Result, TransportError};

#[derive(Debug)]
pub struct TableEntry {
    pub fd: RawFd,
    pub connection: Arc<Connection>,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: Vec<TableEntry>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Grow by one entry. `OutOfMemory` leaves the table unchanged.
    pub fn insert(&mut self, connection: Arc<Connection>) -> Result<()> {
        self.entries
            .try_reserve(1)
            .map_err(|_| TransportError::OutOfMemory)?;
        self.entries.push(TableEntry {
            fd: connection.fd(),
            connection,
        });
        Ok(())
    }

    /// Splice every connection of a drained batch out of the table.
    ///
    /// Swap-with-last, urutan tidak dipertahankan. Connection yang sudah
    /// tidak ada di table dilewati saja. Returns the number removed.
    pub fn remove_entries(
        &mut self,
        batch: &ReclaimBatch<Arc<Connection>>,
        watch: Option<&WatchSet>,
    ) -> usize {
        let mut removed = 0;
        for conn in batch {
            let fd = conn.fd();
            let found = self
                .entries
                .iter()
                .position(|e| e.fd == fd && Arc::ptr_eq(&e.connection, conn));
            match found {
                Some(i) => {
                    self.entries.swap_remove(i);
                    if let Some(watch) = watch {
                        watch.deregister(fd);
                    }
                    removed += 1;
                }
                None => trace!(conn = conn.id(), fd, "already out of the table"),
            }
        }
        removed
    }

    pub fn contains(&self, connection: &Arc<Connection>) -> bool {
        self.entries
            .iter()
            .any(|e| Arc::ptr_eq(&e.connection, connection))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TableEntry> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, TableEntry> {
        self.entries.drain(..)
    }
}
