//! Stream framing: accumulates raw bytes from one connection and carves out
//! whole MQTT packets, resolving TCP message boundaries.

use super::codec::{decode_varint, CodecError};
use bytes::{Bytes, BytesMut};

/// Per-connection frame extractor.
///
/// A single call to [`Framer::next_frame`] yields at most one packet; callers
/// iterate until it returns `Ok(None)` since one chunk may complete several
/// packets.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    max_packet_size: usize,
}

impl Framer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_packet_size,
        }
    }

    /// Append an inbound chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Detach the next complete packet, or `Ok(None)` if more bytes are
    /// needed. Packets whose remaining-length exceeds the configured maximum
    /// are rejected as malformed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let Some((remaining, varint_len)) = decode_varint(&self.buf[1..])? else {
            return Ok(None);
        };
        if remaining > self.max_packet_size {
            return Err(CodecError::MalformedPacket);
        }
        let total = 1 + varint_len + remaining;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }
}
