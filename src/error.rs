//! Error taxonomy untuk network layer
//!
//! Setup failures dikembalikan langsung ke caller. Per-connection failures
//! di dalam poll cycle tidak pernah naik ke dispatcher; mereka diubah
//! menjadi `CloseConnection` job.

use std::io;

use thiserror::Error;

/// Errors produced by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A fallible allocation could not be satisfied.
    #[error("out of memory")]
    OutOfMemory,

    /// Socket option, bind, listen or poll registration failed.
    #[error("internal error during {context}: {source}")]
    InternalError {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Nothing complete arrived before the receive timeout. Retry.
    #[error("communication timeout")]
    CommunicationTimeout,

    /// The connection is gone. Terminal for this connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Endpoint url failed validation.
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),

    /// Host lookup gave no IPv4 address.
    #[error("DNS lookup of {0} failed")]
    HostResolution(String),

    /// Synchronous connect failed.
    #[error("connection failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// The message assembler saw a chunk header it cannot accept.
    #[error("malformed chunk of {size} bytes")]
    MalformedChunk { size: usize },

    /// This connection variant does not provide the callback.
    #[error("{0} is not supported on this connection")]
    Unsupported(&'static str),
}

impl TransportError {
    pub(crate) fn internal(context: &'static str, source: io::Error) -> Self {
        Self::InternalError { context, source }
    }

    /// Only a timeout leaves the connection usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CommunicationTimeout)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors from loading a [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_recoverable() {
        assert!(TransportError::CommunicationTimeout.is_recoverable());
        assert!(!TransportError::ConnectionClosed.is_recoverable());
        assert!(!TransportError::OutOfMemory.is_recoverable());
    }

    #[test]
    fn test_internal_error_keeps_context() {
        let err = TransportError::internal(
            "bind",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        let msg = err.to_string();
        assert!(msg.contains("bind"));
        assert!(msg.contains("address in use"));
    }
}
