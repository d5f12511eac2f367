//! Protocol Layer: message assembly di atas raw TCP bytes
//!
//! Network layer hanya memindahkan bytes. Batas message ditentukan oleh
//! `MessageAssembler` yang dipasang di setiap connection.

mod chunk;

pub use chunk::{
    encode_chunk, ChunkAssembler, ChunkHeader, MessageAssembler, PassThrough, CHUNK_HEADER_SIZE,
};
