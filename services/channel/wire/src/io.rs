//! Async frame I/O over a byte stream.
//!
//! [`FrameReader`] keeps a read-ahead buffer, so side-channel bytes that
//! arrived together with a frame must be drained through it with
//! [`FrameReader::copy_raw`] rather than read from the socket directly.

use crate::frame::{Frame, FrameDecoder};
use crate::WireError;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const READ_CHUNK: usize = 8 * 1024;

/// Reads frames and raw side-channel bytes from an async reader
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader that rejects frames above `max_frame_size`
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Read the next complete frame.
    ///
    /// A peer that closes between frames yields [`WireError::Closed`]; one
    /// that closes mid-frame yields [`WireError::Incomplete`].
    pub async fn read_frame(&mut self) -> Result<Frame, WireError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                trace!(
                    "decoded frame sink={} meta={} body={}",
                    frame.header.sink_id,
                    frame.meta_raw.len(),
                    frame.body.len()
                );
                return Ok(frame);
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Err(WireError::Closed)
                } else {
                    Err(WireError::Incomplete)
                };
            }
        }
    }

    /// Move exactly `len` side-channel bytes into `out`
    pub async fn copy_raw<W>(&mut self, len: u64, out: &mut W) -> Result<u64, WireError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let buffered = (self.buf.len() as u64).min(len) as usize;
        if buffered > 0 {
            out.write_all(&self.buf[..buffered]).await?;
            self.buf.advance(buffered);
        }

        let remaining = len - buffered as u64;
        if remaining > 0 {
            let mut limited = (&mut self.reader).take(remaining);
            let copied = tokio::io::copy(&mut limited, out).await?;
            if copied < remaining {
                return Err(WireError::Incomplete);
            }
        }

        out.flush().await?;
        Ok(len)
    }

    /// Bytes read from the socket but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Mutable access to the underlying reader
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

/// Writes encoded frames and raw side-channel bytes to an async writer
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write an already-encoded frame
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), WireError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Copy exactly `len` bytes from `src` to the wire.
    ///
    /// A source that ends early fails with [`WireError::StreamLength`]; the
    /// peer is then out of sync and the connection must be dropped.
    pub async fn write_raw<S>(&mut self, src: &mut S, len: u64) -> Result<u64, WireError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let mut limited = src.take(len);
        let actual = tokio::io::copy(&mut limited, &mut self.writer).await?;
        if actual != len {
            return Err(WireError::StreamLength {
                expected: len,
                actual,
            });
        }
        self.writer.flush().await?;
        Ok(actual)
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Mutable access to the underlying writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}
