//! Message framing for the wire protocol.
//!
//! A frame is a length prefix, the fixed header, the CBOR metadata section
//! and the sink-serialized body. Side-channel stream bytes are written after
//! the frame and are not part of it.

use crate::header::{crc32_frame_header, Flags, FrameHeader, FRAME_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Size of the `frame_len` prefix
pub const LEN_PREFIX_SIZE: usize = 4;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header
    pub header: FrameHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Sink-serialized message body
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame, fixing up `meta_len` in the header
    pub fn new(mut header: FrameHeader, meta_raw: Bytes, body: Bytes) -> Self {
        header.meta_len = meta_raw.len() as u32;
        Self {
            header,
            meta_raw,
            body,
        }
    }

    /// Get the total frame size when encoded, including the length prefix
    pub fn encoded_size(&self) -> usize {
        LEN_PREFIX_SIZE + FRAME_HEADER_SIZE + self.meta_raw.len() + self.body.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size - LEN_PREFIX_SIZE > max_frame_size {
            return Err(crate::WireError::Size(total_size - LEN_PREFIX_SIZE));
        }
        if self.meta_raw.len() > MAX_META_SIZE {
            return Err(crate::WireError::Meta);
        }

        let mut header = self.header;
        header.meta_len = self.meta_raw.len() as u32;
        header.hdr_csum = if header.flags.contains(Flags::HDR_CHECKSUM) {
            crc32_frame_header(&header, &self.meta_raw)
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(total_size);
        buf.put_u32((total_size - LEN_PREFIX_SIZE) as u32);
        header.encode(&mut buf);
        buf.put_slice(&self.meta_raw);
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame decoder that rejects frames larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured frame size limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. Oversized frames
    /// are rejected as soon as the length prefix is visible.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        if buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }
        if frame_len < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }

        if buf.len() < LEN_PREFIX_SIZE + frame_len {
            buf.reserve(LEN_PREFIX_SIZE + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LEN_PREFIX_SIZE);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let header = FrameHeader::decode(&mut frame_buf)?;

        let meta_len = header.meta_len as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(crate::WireError::Meta);
        }

        let meta_raw = frame_buf.split_to(meta_len);

        if header.flags.contains(Flags::HDR_CHECKSUM)
            && crc32_frame_header(&header, &meta_raw) != header.hdr_csum
        {
            return Err(crate::WireError::HdrCsum);
        }

        Ok(Some(Frame {
            header,
            meta_raw,
            body: frame_buf,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut header = FrameHeader::new(1);
        header.flags |= Flags::HDR_CHECKSUM;
        Frame::new(
            header,
            Bytes::from_static(b"\xa0"),
            Bytes::from_static(b"hello world"),
        )
    }

    #[test]
    fn test_encode_then_decode() {
        let frame = sample_frame();
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(encoded.len(), frame.encoded_size());

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.body, frame.body);
        assert_eq!(decoded.meta_raw, frame.meta_raw);
        assert_eq!(decoded.header.sink_id, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let encoded = sample_frame().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 3..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_trailing_bytes_left_in_buffer() {
        let encoded = sample_frame().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        buf.extend_from_slice(b"stream");

        FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], b"stream");
    }

    #[test]
    fn test_encode_respects_limit() {
        let frame = sample_frame();
        let result = frame.encode(8);
        assert!(matches!(result, Err(crate::WireError::Size(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let mut decoder = FrameDecoder::with_max_frame_size(512);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::Size(1024))
        ));
    }

    #[test]
    fn test_decode_detects_checksum_mismatch() {
        let encoded = sample_frame().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        // first meta byte sits right after the prefix and header
        buf[LEN_PREFIX_SIZE + FRAME_HEADER_SIZE] = 0xa1;
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(crate::WireError::HdrCsum)
        ));
    }
}
