//! Message assembly: dari raw bytes ke complete messages
//!
//! Layout chunk header (8 bytes, little-endian):
//! ┌──────────────┬────────────┬──────────────────────────┐
//! │ type (3 B)   │ chunk (1 B)│ total size incl. header  │
//! │ "HEL"/"MSG"  │ 'F'/'C'/'A'│ u32                      │
//! └──────────────┴────────────┴──────────────────────────┘
//!
//! Network layer tidak tahu batas message; assembler yang memutuskan.

use crate::error::{Result, TransportError};

pub const CHUNK_HEADER_SIZE: usize = 8;

/// Turns a received byte span into complete protocol messages.
///
/// `pending` belongs to the connection and carries a trailing partial
/// message from one receive to the next. `Ok(None)` means nothing is
/// complete yet.
pub trait MessageAssembler: Send + Sync {
    fn complete_messages(&self, pending: &mut Vec<u8>, received: Vec<u8>)
        -> Result<Option<Vec<u8>>>;
}

/// Every received span is complete as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl MessageAssembler for PassThrough {
    fn complete_messages(
        &self,
        pending: &mut Vec<u8>,
        received: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        if received.is_empty() {
            return Ok(None);
        }
        if pending.is_empty() {
            return Ok(Some(received));
        }
        let mut joined = std::mem::take(pending);
        joined.extend_from_slice(&received);
        Ok(Some(joined))
    }
}

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_type: [u8; 3],
    pub chunk_type: u8,
    pub size: u32,
}

impl ChunkHeader {
    #[inline]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return None;
        }
        Some(Self {
            message_type: [buf[0], buf[1], buf[2]],
            chunk_type: buf[3],
            size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[..3].copy_from_slice(&self.message_type);
        out[3] = self.chunk_type;
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Header size field for a body of `body_len` bytes
fn chunk_size(body_len: usize) -> Result<u32> {
    let size = body_len.saturating_add(CHUNK_HEADER_SIZE);
    u32::try_from(size).map_err(|_| TransportError::MalformedChunk { size })
}

/// Build one final chunk around `body`.
///
/// `MalformedChunk` when header plus body does not fit the u32 size field.
pub fn encode_chunk(message_type: [u8; 3], body: &[u8]) -> Result<Vec<u8>> {
    let header = ChunkHeader {
        message_type,
        chunk_type: b'F',
        size: chunk_size(body.len())?,
    };
    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    Ok(out)
}

/// Cuts spans on chunk headers and keeps the incomplete tail
#[derive(Debug, Clone, Copy)]
pub struct ChunkAssembler {
    max_chunk_size: usize,
}

impl ChunkAssembler {
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }
}

impl MessageAssembler for ChunkAssembler {
    fn complete_messages(
        &self,
        pending: &mut Vec<u8>,
        received: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let mut buf = if pending.is_empty() {
            received
        } else {
            let mut joined = std::mem::take(pending);
            joined.extend_from_slice(&received);
            joined
        };

        let mut complete = 0;
        while let Some(header) = ChunkHeader::parse(&buf[complete..]) {
            let size = header.size as usize;
            if size < CHUNK_HEADER_SIZE || size > self.max_chunk_size {
                return Err(TransportError::MalformedChunk { size });
            }
            if buf.len() - complete < size {
                break;
            }
            complete += size;
        }

        if complete < buf.len() {
            *pending = buf.split_off(complete);
        }
        if complete == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}
