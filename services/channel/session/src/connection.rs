//! One live physical connection of a session.

use crate::error::{ChannelError, Result};
use crate::ids::ConnectionId;
use crate::send_task::{Outbound, SendTask};
use crate::signal::Signal;
use crate::transport::IoStream;
use channel_wire::{FrameReader, FrameWriter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::debug;

/// Reader half as consumed by the receive loop
pub type ConnectionReader = FrameReader<ReadHalf<IoStream>>;

/// Queue consumed by the sender loop
pub type SendQueue = mpsc::UnboundedReceiver<Arc<SendTask>>;

/// Socket, send queue and close signal of one connection.
///
/// The reader and the queue receiver are handed out once, to the receive
/// and sender loops respectively. Every write goes through the writer lock.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<IoStream>>>,
    reader: Mutex<Option<ConnectionReader>>,
    queue_tx: mpsc::UnboundedSender<Arc<SendTask>>,
    queue_rx: Mutex<Option<SendQueue>>,
    closed: Signal,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl Connection {
    /// Wrap a stream; inbound frames above `max_receive_message_size` are rejected
    pub fn new(stream: IoStream, max_receive_message_size: usize) -> std::io::Result<Arc<Self>> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            id: ConnectionId::next(),
            local_addr,
            remote_addr,
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half)),
            reader: Mutex::new(Some(FrameReader::new(read_half, max_receive_message_size))),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            closed: Signal::new(),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }))
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the connection has not been closed
    pub fn is_alive(&self) -> bool {
        !self.closed.is_set()
    }

    /// Mark the connection closed; both loops stop and tear the socket down
    pub fn close(&self) {
        if self.is_alive() {
            debug!("Closing {} to {}", self.id, self.remote_addr);
        }
        self.closed.set();
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    /// Hand the reader to the receive loop; `None` once taken
    pub fn take_reader(&self) -> Option<ConnectionReader> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Hand the queue to the sender loop; `None` once taken
    pub fn take_queue(&self) -> Option<SendQueue> {
        self.queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queue a task for the sender loop
    pub fn enqueue(&self, task: Arc<SendTask>) -> Result<()> {
        if !self.is_alive() {
            return Err(ChannelError::ConnectionClosed);
        }
        self.queue_tx
            .send(task)
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Write a frame and its streams as one unit under the writer lock
    pub async fn write_outbound(&self, outbound: Outbound) -> Result<()> {
        let Outbound { frame, streams } = outbound;
        let mut writer = self.writer.lock().await;

        writer.write_frame(&frame).await?;
        let mut total = frame.len() as u64;
        for mut stream in streams {
            let len = stream.len();
            total += writer.write_raw(&mut stream, len).await?;
        }

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(total, Ordering::Relaxed);
        Ok(())
    }

    /// Shut the write direction down, waiting for any write in progress
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.id, e);
        }
    }

    /// Frames fully written so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Bytes written so far, side-channel bytes included
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, StreamSource};
    use bytes::Bytes;
    use channel_wire::{FrameBuilder, DEFAULT_MAX_FRAME_SIZE};

    fn pair() -> (Arc<Connection>, IoStream) {
        let (a, b) = IoStream::memory_pair(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
            64 * 1024,
        );
        (Connection::new(a, DEFAULT_MAX_FRAME_SIZE).unwrap(), b)
    }

    #[tokio::test]
    async fn test_reader_and_queue_taken_once() {
        let (conn, _peer) = pair();
        assert_eq!(conn.local_addr().port(), 1000);
        assert_eq!(conn.remote_addr().port(), 2000);
        assert!(conn.take_reader().is_some());
        assert!(conn.take_reader().is_none());
        assert!(conn.take_queue().is_some());
        assert!(conn.take_queue().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (conn, _peer) = pair();
        conn.close();
        assert!(!conn.is_alive());

        let task = Arc::new(SendTask::new(
            MessageType::Datagram,
            "c1",
            conn.id(),
            Outbound {
                frame: Bytes::new(),
                streams: Vec::new(),
            },
        ));
        assert!(matches!(
            conn.enqueue(task),
            Err(ChannelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_outbound_accounts_stream_bytes() {
        let (conn, peer) = pair();
        let mut reader = FrameReader::new(peer, DEFAULT_MAX_FRAME_SIZE);

        let frame = FrameBuilder::new(1)
            .with_streams()
            .body(Bytes::from_static(b"body"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let frame_len = frame.len() as u64;
        conn.write_outbound(Outbound {
            frame,
            streams: vec![StreamSource::from_bytes(Bytes::from_static(b"abcdef"))],
        })
        .await
        .unwrap();

        assert_eq!(conn.frames_written(), 1);
        assert_eq!(conn.bytes_written(), frame_len + 6);

        let received = reader.read_frame().await.unwrap();
        assert_eq!(&received.body[..], b"body");
        let mut stream = Vec::new();
        reader.copy_raw(6, &mut stream).await.unwrap();
        assert_eq!(&stream[..], b"abcdef");
    }
}
