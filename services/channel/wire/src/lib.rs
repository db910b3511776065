//! Wire protocol framing, frame headers, CBOR metadata and async frame I/O.
//!
//! This crate provides the low-level wire protocol for the RPC channel:
//! length-prefixed frames, a small fixed header naming the serializer that
//! produced the body, and the plumbing to move side-channel stream bytes
//! that follow a frame.
//!
//! ## Features
//!
//! - **Fixed Header**: 12-byte header with sink id and optional CRC32
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CBOR Metadata**: Extensible metadata using canonical CBOR
//! - **Side-Channel Streams**: Raw bytes after a frame, outside `frame_len`
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Header (12B)         | ver, flags, sink, meta_len,|
//! |                      | hdr_csum                   |
//! +----------------------+----------------------------+
//! | meta_bytes           | metadata (CBOR)            |
//! +----------------------+----------------------------+
//! | body                 | sink-serialized message    |
//! +----------------------+----------------------------+
//! | stream bytes (opt)   | declared lengths, in order |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod io;

// Re-export main types
pub use codec::{
    get_meta_str, get_meta_u64, parse_meta, CodecError, FrameBuilder, MetaBuilder,
};
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, LEN_PREFIX_SIZE, MAX_META_SIZE};
pub use header::{crc32_frame_header, Flags, FrameHeader, FRAME_HEADER_SIZE, WIRE_VERSION};
pub use io::{FrameReader, FrameWriter};
