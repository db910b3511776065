//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Stream ended in the middle of a frame or side-channel payload
    #[error("incomplete frame")]
    Incomplete,

    /// Stream ended cleanly on a frame boundary
    #[error("connection closed by peer")]
    Closed,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Invalid CBOR metadata
    #[error("cbor meta invalid")]
    Meta,

    /// Header checksum mismatch
    #[error("hdr checksum mismatch")]
    HdrCsum,

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Side-channel source delivered a different number of bytes than declared
    #[error("stream length mismatch: declared {expected}, got {actual}")]
    StreamLength {
        /// Declared length
        expected: u64,
        /// Bytes actually transferred
        actual: u64,
    },

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether this error means the peer simply went away between frames
    pub fn is_clean_close(&self) -> bool {
        matches!(self, WireError::Closed)
    }
}
