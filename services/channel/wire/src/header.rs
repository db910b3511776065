//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 12-byte header naming the sink that produced the
//! body and the length of the CBOR metadata section that follows it.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 12;

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// Header carries a CRC32 over header fields and metadata
        const HDR_CHECKSUM = 1 << 0;
        /// Side-channel stream bytes follow this frame on the wire
        const HAS_STREAMS = 1 << 1;
    }
}

/// Frame header structure (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame flags
    pub flags: Flags,
    /// Id of the sink that serialized the body
    pub sink_id: u16,
    /// Length of the CBOR metadata section
    pub meta_len: u32,
    /// CRC32 over the header fields and metadata, 0 unless `HDR_CHECKSUM`
    pub hdr_csum: u32,
}

impl FrameHeader {
    /// Create a new header for the given sink
    pub fn new(sink_id: u16) -> Self {
        Self {
            ver: WIRE_VERSION,
            flags: Flags::empty(),
            sink_id,
            meta_len: 0,
            hdr_csum: 0,
        }
    }

    /// Whether side-channel bytes follow the frame
    pub fn has_streams(&self) -> bool {
        self.flags.contains(Flags::HAS_STREAMS)
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.sink_id);
        buf.put_u32(self.meta_len);
        buf.put_u32(self.hdr_csum);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let flags = Flags::from_bits(buf.get_u8()).ok_or(crate::WireError::Reserved)?;
        let sink_id = buf.get_u16();
        let meta_len = buf.get_u32();
        let hdr_csum = buf.get_u32();

        Ok(Self {
            ver,
            flags,
            sink_id,
            meta_len,
            hdr_csum,
        })
    }
}

/// Calculate the CRC32 checksum for a header and its metadata
pub fn crc32_frame_header(header: &FrameHeader, meta: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[header.ver, header.flags.bits()]);
    hasher.update(&header.sink_id.to_be_bytes());
    hasher.update(&header.meta_len.to_be_bytes());
    hasher.update(meta);
    hasher.finalize()
}
