//! Configuration untuk connection dan server layer
//!
//! Semua struct punya `Default` yang langsung bisa dipakai, dan bisa
//! di-load dari TOML. Field yang tidak ada di file memakai default.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Local or negotiated buffer limits of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub protocol_version: u32,
    /// Bytes requested from the socket per receive call
    pub recv_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    /// 0 = unlimited
    pub max_chunk_count: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            recv_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 1024 * 1024,
            max_chunk_count: 0,
        }
    }
}

/// Who owns a buffer after it has been handed out.
///
/// `Reuse` keeps one cached buffer and hands it out again after release.
/// `PerCall` allocates on every acquire and frees on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    #[default]
    Reuse,
    PerCall,
}

/// Message assembler wired into accepted connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Every received span is one job payload
    #[default]
    Raw,
    /// Spans are cut on 8-byte chunk headers
    Chunked,
}

/// Server network layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: i32,
    pub connection: ConnectionConfig,
    pub buffer_policy: BufferPolicy,
    pub framing: Framing,
    /// Readiness wait per poll cycle
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4840,
            backlog: 100,
            connection: ConnectionConfig::default(),
            buffer_policy: BufferPolicy::default(),
            framing: Framing::default(),
            poll_timeout_ms: 50,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.recv_buffer_size == 0 || conn.send_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer sizes must be greater than zero".into(),
            ));
        }
        if conn.max_message_size < conn.recv_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "max_message_size {} is smaller than recv_buffer_size {}",
                conn.max_message_size, conn.recv_buffer_size
            )));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
