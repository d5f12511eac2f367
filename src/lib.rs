//! netlayer - TCP network layer dengan deferred connection reclamation
//!
//! Arsitektur:
//! - Readiness: mio poll, satu network thread
//! - Lock-Free: reclamation list berbasis atomic CAS
//! - Deferred free: connection yang di-close baru dilepas lewat delayed job
//! - Framing: raw bytes atau chunk dengan header 8 byte

pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod network;
pub mod protocol;

pub use config::{BufferPolicy, ConnectionConfig, Framing, ServerConfig};
pub use dispatch::{Dispatcher, JobHandler};
pub use error::{ConfigError, Result, TransportError};
pub use network::{connect, Connection, ConnectionState, DelayedCall, Job, ServerNetworkLayer};
