//! Network Layer: readiness-driven TCP di atas mio
//!
//! Fitur:
//! - Satu network thread: accept, receive, dan produksi job per cycle
//! - Connection handle yang aman dipakai worker threads
//! - Close yang di-defer: fd baru ditutup setelah semua job sebelumnya selesai
//! - Client connect untuk `opc.tcp://host:port`

mod client;
pub(crate) mod connection;
mod job;
mod poller;
mod server;
mod socket;
mod table;

pub use client::{connect, connect_with, parse_endpoint, Endpoint, MAX_URL_LEN, MIN_URL_LEN};
pub use connection::{Connection, ConnectionCallbacks, ConnectionState};
pub use job::{DelayedCall, Job};
pub use poller::{token_for, WatchSet, LISTENER};
pub use server::{ServerNetworkLayer, SCHEME};
pub use table::{ConnectionTable, TableEntry};
