//! Side-channel stream reception into temp storage.

use crate::error::{ChannelError, Result};
use crate::message::StreamSource;
use channel_wire::FrameReader;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};
use tracing::debug;

/// Prefix of every materialized stream file
pub const STREAM_FILE_PREFIX: &str = "rpc-stream-";

/// Receives one declared-length stream that follows a frame on the wire
#[derive(Debug, Clone)]
pub struct StreamTransferTask {
    folder: PathBuf,
    declared_len: u64,
    max_len: u64,
}

impl StreamTransferTask {
    /// Prepare to receive `declared_len` bytes into `folder`
    pub fn new(folder: impl Into<PathBuf>, declared_len: u64, max_len: u64) -> Self {
        Self {
            folder: folder.into(),
            declared_len,
            max_len,
        }
    }

    /// Copy exactly the declared number of bytes into a new temp file.
    ///
    /// An oversized declaration fails before a single byte is read. On any
    /// failure the partially written file is removed.
    pub async fn receive<R>(self, reader: &mut FrameReader<R>) -> Result<ReceivedStream>
    where
        R: AsyncRead + Unpin,
    {
        if self.declared_len > self.max_len {
            return Err(ChannelError::Security(format!(
                "declared stream of {} bytes exceeds max receive stream size {}",
                self.declared_len, self.max_len
            )));
        }

        let named = tempfile::Builder::new()
            .prefix(STREAM_FILE_PREFIX)
            .tempfile_in(&self.folder)?;
        let (std_file, path) = named.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        reader.copy_raw(self.declared_len, &mut file).await?;
        file.seek(SeekFrom::Start(0)).await?;

        debug!(
            "Received {} stream bytes into {}",
            self.declared_len,
            path.display()
        );

        Ok(ReceivedStream {
            file,
            path,
            len: self.declared_len,
        })
    }
}

/// Read-once handle over a materialized stream; deletes its file on drop
#[derive(Debug)]
pub struct ReceivedStream {
    file: tokio::fs::File,
    path: TempPath,
    len: u64,
}

impl ReceivedStream {
    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Turn the handle into a source so the stream can be forwarded
    pub fn into_source(self) -> StreamSource {
        let len = self.len;
        StreamSource::from_reader(self, len)
    }
}

impl AsyncRead for ReceivedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}
