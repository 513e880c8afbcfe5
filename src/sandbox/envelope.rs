//! Connect protocol envelopes for server-streaming RPCs.
//!
//! Each frame is one flag byte, a big-endian `u32` payload length and the
//! payload. Flag bit `0x02` marks the end-of-stream frame, whose JSON payload
//! may carry an `error`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Wrap one message payload into a frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder; feed it body chunks as they arrive.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, String> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        if flags & FLAG_COMPRESSED != 0 {
            return Err("compressed frames are not supported".to_string());
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }

    /// Bytes left over that do not form a full frame.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Payload of the end-of-stream frame.
#[derive(Debug, Default, Deserialize)]
pub struct EndStream {
    #[serde(default)]
    pub error: Option<EndStreamError>,
}

#[derive(Debug, Deserialize)]
pub struct EndStreamError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}
