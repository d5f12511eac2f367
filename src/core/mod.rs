//! Core module: lock-free reclamation dan buffer ownership
//!
//! Prinsip desain:
//! - Lock-Free: reclamation list hanya memakai atomic CAS/swap
//! - Single consumer: hanya network thread yang men-drain list
//! - Buffer policy dipilih sekali dari config

mod buffer;
mod reclaim;

pub use buffer::{alloc_zeroed, BufferPool};
pub use reclaim::{Iter, ReclaimBatch, ReclaimList};
