//! Buffer ownership policy
//!
//! Satu tipe, satu keputusan dari config: cache satu buffer untuk dipakai
//! ulang (`Reuse`) atau alokasi baru setiap acquire (`PerCall`). Buffer
//! yang sedang dipegang caller selalu milik caller, jadi lifetime-nya tidak
//! pernah melewati pemakaian konkuren.

use std::sync::Mutex;

use crate::config::BufferPolicy;
use crate::error::{Result, TransportError};

/// Zero-filled buffer of `len` bytes, `OutOfMemory` instead of aborting
pub fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| TransportError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

pub struct BufferPool {
    policy: BufferPolicy,
    cached: Mutex<Option<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            cached: Mutex::new(None),
        }
    }

    #[inline]
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Hand out a zero-filled buffer of `len` bytes.
    pub fn acquire(&self, len: usize) -> Result<Vec<u8>> {
        if self.policy == BufferPolicy::Reuse {
            if let Some(mut buf) = self.take_cached() {
                let extra = len.saturating_sub(buf.capacity());
                buf.try_reserve_exact(extra)
                    .map_err(|_| TransportError::OutOfMemory)?;
                buf.resize(len, 0);
                return Ok(buf);
            }
        }
        alloc_zeroed(len)
    }

    /// Take a buffer back. `Reuse` keeps it for the next acquire.
    pub fn release(&self, mut buf: Vec<u8>) {
        if self.policy != BufferPolicy::Reuse {
            return;
        }
        buf.clear();
        if let Ok(mut slot) = self.cached.lock() {
            if slot.is_none() {
                *slot = Some(buf);
            }
        }
    }

    /// Drop the cached buffer, if any
    pub fn clear(&self) {
        if let Ok(mut slot) = self.cached.lock() {
            slot.take();
        }
    }

    pub fn has_cached(&self) -> bool {
        self.cached.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn take_cached(&self) -> Option<Vec<u8>> {
        self.cached.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_hands_back_same_allocation() {
        let pool = BufferPool::new(BufferPolicy::Reuse);
        let buf = pool.acquire(1024).unwrap();
        assert_eq!(buf.len(), 1024);
        let ptr = buf.as_ptr();

        pool.release(buf);
        assert!(pool.has_cached());

        let again = pool.acquire(512).unwrap();
        assert_eq!(again.len(), 512);
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_per_call_never_caches() {
        let pool = BufferPool::new(BufferPolicy::PerCall);
        let buf = pool.acquire(64).unwrap();
        pool.release(buf);
        assert!(!pool.has_cached());
    }

    #[test]
    fn test_reuse_with_two_outstanding_buffers() {
        let pool = BufferPool::new(BufferPolicy::Reuse);
        let a = pool.acquire(16).unwrap();
        let b = pool.acquire(16).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        pool.release(a);
        pool.release(b); // slot already full, dropped
        assert!(pool.has_cached());

        pool.clear();
        assert!(!pool.has_cached());
    }

    #[test]
    fn test_alloc_zeroed_huge_is_oom() {
        let err = alloc_zeroed(usize::MAX).unwrap_err();
        assert!(matches!(err, TransportError::OutOfMemory));
    }
}
