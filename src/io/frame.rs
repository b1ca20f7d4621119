//! Binary protocol framing
//!
//! Every frame starts with a fixed 24-byte header:
//!
//! ```text
//! offset  size  field
//!      0     1  magic
//!      1     1  opcode
//!      2     2  key length
//!      4     1  extras length
//!      5     1  datatype
//!      6     2  vbucket / status
//!      8     4  total body length (big-endian)
//!     12     4  opaque (big-endian)
//!     16     8  cas
//! ```
//!
//! A frame is exactly `HEADER_LEN + body length` bytes. TCP gives no message
//! boundaries, so the decoder keeps any remainder buffered as the start of the
//! next frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

use crate::topology::ConfigVersion;

pub const HEADER_LEN: usize = 24;
pub const OFFSET_OPCODE: usize = 1;
pub const OFFSET_KEY_LEN: usize = 2;
pub const OFFSET_EXTRAS_LEN: usize = 4;
pub const OFFSET_VBUCKET: usize = 6;
pub const OFFSET_BODY_LEN: usize = 8;
pub const OFFSET_OPAQUE: usize = 12;

/// Response to a client request
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Unsolicited request initiated by the server
pub const MAGIC_SERVER_REQUEST: u8 = 0x82;
/// Server request opcode announcing a new cluster map
pub const OPCODE_CLUSTERMAP_CHANGE: u8 = 0x01;

/// Largest encoded request a connection will write (20 MiB)
pub const MAX_REQUEST_LEN: usize = 20 * 1024 * 1024;

/// Read the opaque of a complete frame
#[inline]
pub fn read_opaque(frame: &[u8]) -> Option<u32> {
    let bytes = frame.get(OFFSET_OPAQUE..OFFSET_OPAQUE + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Copy of a request frame with its vbucket and opaque fields overwritten
///
/// Returns `None` if `frame` is shorter than a header.
pub fn stamp_request(frame: &[u8], vbucket: u16, opaque: u32) -> Option<Bytes> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let mut buf = BytesMut::from(frame);
    buf[OFFSET_VBUCKET..OFFSET_VBUCKET + 2].copy_from_slice(&vbucket.to_be_bytes());
    buf[OFFSET_OPAQUE..OFFSET_OPAQUE + 4].copy_from_slice(&opaque.to_be_bytes());
    Some(buf.freeze())
}

#[inline]
pub fn is_server_request(frame: &[u8]) -> bool {
    frame.first() == Some(&MAGIC_SERVER_REQUEST)
}

/// Splits a byte stream into owned, contiguous frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body_len: usize,
}

impl FrameCodec {
    pub fn new(max_body_len: usize) -> Self {
        FrameCodec { max_body_len }
    }

    /// Extract one complete frame from the front of `input`
    ///
    /// Returns `Ok(None)` when more bytes are needed. The consumed bytes are
    /// removed from `input`.
    pub fn parse(&self, input: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if input.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = (&input[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4]).get_u32() as usize;
        if body_len > self.max_body_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame body of {} bytes exceeds limit of {} bytes",
                    body_len, self.max_body_len
                ),
            ));
        }

        let frame_len = HEADER_LEN + body_len;
        if input.len() < frame_len {
            input.reserve(frame_len - input.len());
            return Ok(None);
        }

        Ok(Some(input.split_to(frame_len).freeze()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        // Responses carry at most one document plus headers
        FrameCodec::new(MAX_REQUEST_LEN + 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.parse(src)
    }
}

/// A cluster-map change announced by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPush {
    /// Bucket named in the key, empty for cluster-level maps
    pub bucket: String,
    pub version: ConfigVersion,
}

impl ServerPush {
    /// Decode a cluster-map change notification
    ///
    /// Extras hold the epoch then the revision, both big-endian u64. Returns
    /// `None` for any other server request.
    pub fn decode(frame: &[u8]) -> Option<ServerPush> {
        if frame.len() < HEADER_LEN || !is_server_request(frame) {
            return None;
        }
        if frame[OFFSET_OPCODE] != OPCODE_CLUSTERMAP_CHANGE {
            return None;
        }

        let key_len =
            u16::from_be_bytes([frame[OFFSET_KEY_LEN], frame[OFFSET_KEY_LEN + 1]]) as usize;
        let extras_len = frame[OFFSET_EXTRAS_LEN] as usize;
        if extras_len < 16 || frame.len() < HEADER_LEN + extras_len + key_len {
            return None;
        }

        let mut extras = &frame[HEADER_LEN..HEADER_LEN + extras_len];
        let epoch = extras.get_u64();
        let revision = extras.get_u64();
        let key_start = HEADER_LEN + extras_len;
        let bucket = String::from_utf8_lossy(&frame[key_start..key_start + key_len]).into_owned();

        Some(ServerPush {
            bucket,
            version: ConfigVersion::new(epoch, revision),
        })
    }

    /// Encode as a server request frame (used by test servers and tools)
    pub fn encode(&self) -> Bytes {
        let key = self.bucket.as_bytes();
        let body_len = 16 + key.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(MAGIC_SERVER_REQUEST);
        buf.put_u8(OPCODE_CLUSTERMAP_CHANGE);
        buf.put_u16(key.len() as u16);
        buf.put_u8(16);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(body_len as u32);
        buf.put_u32(0);
        buf.put_u64(0);
        buf.put_u64(self.version.epoch);
        buf.put_u64(self.version.revision);
        buf.put_slice(key);
        buf.freeze()
    }
}

/// Build a bare frame with the given magic, opcode, opaque and body
///
/// The transport itself never encodes operations; this exists for tests,
/// benchmarks and diagnostic pings.
pub fn build_frame(magic: u8, opcode: u8, opaque: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(magic);
    buf.put_u8(opcode);
    buf.put_u16(0);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.put_u32(body.len() as u32);
    buf.put_u32(opaque);
    buf.put_u64(0);
    buf.put_slice(body);
    buf.freeze()
}
