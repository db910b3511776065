//! Frame builders and CBOR metadata helpers.

use crate::frame::Frame;
use crate::header::{Flags, FrameHeader};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a u64 value
    pub fn insert_u64(mut self, key: &str, value: u64) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame builder for constructing wire frames
#[derive(Debug)]
pub struct FrameBuilder {
    header: FrameHeader,
    meta: MetaBuilder,
    body: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder for a body produced by sink `sink_id`
    pub fn new(sink_id: u16) -> Self {
        Self {
            header: FrameHeader::new(sink_id),
            meta: MetaBuilder::new(),
            body: Bytes::new(),
        }
    }

    /// Protect header and metadata with a CRC32
    pub fn with_checksum(mut self) -> Self {
        self.header.flags |= Flags::HDR_CHECKSUM;
        self
    }

    /// Announce side-channel stream bytes after the frame
    pub fn with_streams(mut self) -> Self {
        self.header.flags |= Flags::HAS_STREAMS;
        self
    }

    /// Insert string metadata
    pub fn meta_insert_str(mut self, key: &str, value: &str) -> Self {
        self.meta = self.meta.insert_str(key, value);
        self
    }

    /// Insert u64 metadata
    pub fn meta_insert_u64(mut self, key: &str, value: u64) -> Self {
        self.meta = self.meta.insert_u64(key, value);
        self
    }

    /// Insert binary metadata
    pub fn meta_insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.meta = self.meta.insert_bytes(key, value);
        self
    }

    /// Set body
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Build and encode the frame
    pub fn build(self, max_frame: usize) -> Result<Bytes, CodecError> {
        let meta_raw = self.meta.build()?;
        let frame = Frame::new(self.header, meta_raw, self.body);
        frame.encode(max_frame).map_err(CodecError::Wire)
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    if meta_raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get u64 value from metadata
pub fn get_meta_u64(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u64> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
    use bytes::BytesMut;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("cid", "c1")
            .insert_u64("streams", 2)
            .insert_bytes("data", b"test")
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_str(&parsed, "cid"), Some("c1".to_string()));
        assert_eq!(get_meta_u64(&parsed, "streams"), Some(2));
        assert_eq!(get_meta_u64(&parsed, "cid"), None);
    }

    #[test]
    fn test_parse_meta_rejects_non_map() {
        let mut buf = Vec::new();
        ciborium::into_writer(&ciborium::Value::Integer(5.into()), &mut buf).unwrap();
        assert!(matches!(parse_meta(&buf), Err(CodecError::MetaDecode)));
    }

    #[test]
    fn test_frame_builder_with_checksum_and_streams() {
        let frame_bytes = FrameBuilder::new(2)
            .with_checksum()
            .with_streams()
            .meta_insert_str("type", "request")
            .body(Bytes::from_static(b"hello world"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut buf = BytesMut::from(&frame_bytes[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.sink_id, 2);
        assert!(frame.header.has_streams());
        assert_eq!(frame.body, Bytes::from_static(b"hello world"));

        let meta = parse_meta(&frame.meta_raw).unwrap();
        assert_eq!(get_meta_str(&meta, "type"), Some("request".to_string()));
    }

    #[test]
    fn test_frame_builder_size_limit() {
        let result = FrameBuilder::new(1)
            .body(Bytes::from(vec![0u8; 128]))
            .build(64);
        assert!(matches!(
            result,
            Err(CodecError::Wire(crate::WireError::Size(_)))
        ));
    }
}
