//! Session map: one logical session over one live connection at a time.
//!
//! A session owns the current [`Connection`], the tables of sends waiting
//! for an Acknowledge or a Response, and the ordered dispatcher for inbound
//! messages. Each connection runs two loops: the sender drains the
//! connection's queue and is the only writer of application frames, and the
//! receiver reads frames in arrival order, resolves pending sends and hands
//! everything else to the dispatcher. When a connection ends the session
//! survives it; the channel decides whether it is revived or dropped.

use crate::config::ChannelConfig;
use crate::connection::{Connection, ConnectionReader, SendQueue};
use crate::dispatch::OrderedDispatcher;
use crate::error::{ChannelError, Result};
use crate::ids::{ConnectionId, SessionId};
use crate::message::{Message, MessageType, Payload, StreamPayload};
use crate::send_task::{Outbound, SendTask};
use crate::sink::SinkSet;
use crate::stream_transfer::StreamTransferTask;
use async_trait::async_trait;
use channel_wire::{Frame, WireError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Receives connection and message notifications from session maps
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// The receive loop of `connection_id` finished and released its sends
    async fn connection_ended(&self, session_id: &SessionId, connection_id: ConnectionId);

    /// A Request or Datagram arrived, in receipt order unless marked parallel
    async fn message_received(&self, session_id: SessionId, message: Message);
}

/// Snapshot of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session id
    pub session_id: SessionId,
    /// Last known remote endpoint
    pub remote_addr: SocketAddr,
    /// Last known local endpoint
    pub local_addr: SocketAddr,
    /// Whether this side initiated the session and may revive it
    pub reconnectable: bool,
    /// Whether a live connection is attached
    pub connected: bool,
    /// Sends waiting for an Acknowledge
    pub pending_acks: usize,
    /// Sends waiting for a Response
    pub pending_responses: usize,
}

#[derive(Debug)]
struct Link {
    connection: Option<Arc<Connection>>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
}

type PendingTable = Mutex<HashMap<String, Arc<SendTask>>>;

/// One logical session
pub struct SessionMap {
    id: SessionId,
    config: Arc<ChannelConfig>,
    sinks: SinkSet,
    reconnectable: AtomicBool,
    link: RwLock<Link>,
    pending_ack: PendingTable,
    pending_response: PendingTable,
    dispatcher: Arc<OrderedDispatcher>,
    observer: Weak<dyn SessionObserver>,
    reconnect_guard: Mutex<()>,
}

impl SessionMap {
    /// Create a session attached to `connection`; loops are not started yet
    pub fn new(
        id: SessionId,
        config: Arc<ChannelConfig>,
        sinks: SinkSet,
        reconnectable: bool,
        observer: Weak<dyn SessionObserver>,
        connection: Arc<Connection>,
    ) -> Arc<Self> {
        let dispatcher = OrderedDispatcher::new(
            id.clone(),
            observer.clone(),
            config.dispatch_backlog_warning,
            config.dispatch_idle_timeout,
        );
        Arc::new(Self {
            id,
            sinks,
            reconnectable: AtomicBool::new(reconnectable),
            link: RwLock::new(Link {
                remote_addr: connection.remote_addr(),
                local_addr: connection.local_addr(),
                connection: Some(connection),
            }),
            pending_ack: Mutex::new(HashMap::new()),
            pending_response: Mutex::new(HashMap::new()),
            dispatcher,
            observer,
            reconnect_guard: Mutex::new(()),
            config,
        })
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether the session may be revived on a new connection
    pub fn is_reconnectable(&self) -> bool {
        self.reconnectable.load(Ordering::Acquire)
    }

    /// Change the reconnectable flag
    pub fn set_reconnectable(&self, reconnectable: bool) {
        self.reconnectable.store(reconnectable, Ordering::Release);
    }

    /// Guard serializing reconnect attempts for this session
    pub(crate) fn reconnect_guard(&self) -> &Mutex<()> {
        &self.reconnect_guard
    }

    /// Last known remote endpoint
    pub async fn remote_addr(&self) -> SocketAddr {
        self.link.read().await.remote_addr
    }

    /// Last known local endpoint
    pub async fn local_addr(&self) -> SocketAddr {
        self.link.read().await.local_addr
    }

    /// Current connection, live or not
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.link.read().await.connection.clone()
    }

    /// Current connection if it is still live
    pub async fn live_connection(&self) -> Option<Arc<Connection>> {
        self.connection().await.filter(|conn| conn.is_alive())
    }

    /// Whether a live connection is attached
    pub async fn is_connected(&self) -> bool {
        self.live_connection().await.is_some()
    }

    /// Attach a new connection, closing any previous one
    pub async fn attach(&self, connection: Arc<Connection>) {
        let mut link = self.link.write().await;
        link.remote_addr = connection.remote_addr();
        link.local_addr = connection.local_addr();
        if let Some(previous) = link.connection.replace(connection) {
            previous.close();
        }
    }

    /// Drop the connection if it is still the one named
    pub async fn detach(&self, connection_id: ConnectionId) -> bool {
        let mut link = self.link.write().await;
        match &link.connection {
            Some(conn) if conn.id() == connection_id => {
                link.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Close the current connection; the receive loop performs teardown
    pub async fn close(&self) {
        if let Some(conn) = self.connection().await {
            conn.close();
        }
    }

    /// Snapshot for callers
    pub async fn info(&self) -> SessionInfo {
        let (remote_addr, local_addr, connected) = {
            let link = self.link.read().await;
            let connected = link
                .connection
                .as_ref()
                .map(|conn| conn.is_alive())
                .unwrap_or(false);
            (link.remote_addr, link.local_addr, connected)
        };
        SessionInfo {
            session_id: self.id.clone(),
            remote_addr,
            local_addr,
            reconnectable: self.is_reconnectable(),
            connected,
            pending_acks: self.pending_ack.lock().await.len(),
            pending_responses: self.pending_response.lock().await.len(),
        }
    }

    /// Start both loops on the current connection
    pub async fn start(self: &Arc<Self>) {
        self.start_receive().await;
        self.start_send().await;
    }

    /// Start the receive loop once per connection; `false` if already running
    pub async fn start_receive(self: &Arc<Self>) -> bool {
        let Some(conn) = self.live_connection().await else {
            return false;
        };
        match conn.take_reader() {
            Some(reader) => {
                tokio::spawn(self.clone().receive_loop(conn, reader));
                true
            }
            None => false,
        }
    }

    /// Start the sender loop once per connection; `false` if already running
    pub async fn start_send(self: &Arc<Self>) -> bool {
        let Some(conn) = self.live_connection().await else {
            return false;
        };
        match conn.take_queue() {
            Some(queue) => {
                tokio::spawn(self.clone().send_loop(conn, queue));
                true
            }
            None => false,
        }
    }

    /// Send a message and wait for its Acknowledge or Response.
    ///
    /// Acknowledge messages are written immediately and only when
    /// `ack_allowed`. One-way datagrams are queued and return at once. All
    /// other types block until acknowledged, answered, failed or `timeout`;
    /// a timeout closes the connection.
    pub async fn send(
        self: &Arc<Self>,
        mut message: Message,
        timeout: Duration,
        ack_allowed: bool,
    ) -> Result<Option<Message>> {
        let message_type = message.message_type;
        if message_type == MessageType::Acknowledge && !ack_allowed {
            return Err(ChannelError::AckNotAllowed);
        }

        let conn = self
            .live_connection()
            .await
            .ok_or(ChannelError::ConnectionClosed)?;

        let streams = message.detach_streams(self.config.max_send_stream_size)?;
        let frame = self
            .sinks
            .encode_frame(&message, self.config.max_send_message_size)?;
        let outbound = Outbound { frame, streams };

        if message_type == MessageType::Acknowledge {
            return self.write_direct(&conn, outbound).await.map(|_| None);
        }

        let task = Arc::new(SendTask::new(
            message_type,
            message.correlation_id.clone(),
            conn.id(),
            outbound,
        ));
        drop(message);

        self.register(&task).await;
        if let Err(e) = conn.enqueue(task.clone()) {
            self.unregister(&task).await;
            return Err(e);
        }

        if message_type == MessageType::DatagramOneway {
            return Ok(None);
        }

        let waited = tokio::time::timeout(timeout, task.wait_completed()).await;
        self.unregister(&task).await;

        if waited.is_err() && !task.is_finished() {
            warn!(
                "{} {} on session {} not answered within {:?}, closing {}",
                message_type,
                task.correlation_id(),
                self.id,
                timeout,
                conn.id()
            );
            conn.close();
            return Err(ChannelError::Timeout(timeout));
        }

        task.take_result()
    }

    async fn write_direct(&self, conn: &Connection, outbound: Outbound) -> Result<()> {
        if let Err(e) = conn.write_outbound(outbound).await {
            warn!("Direct write on session {} failed: {}", self.id, e);
            conn.close();
            return Err(e.into_io());
        }
        Ok(())
    }

    async fn register(&self, task: &Arc<SendTask>) {
        let message_type = task.message_type();
        let cid = task.correlation_id().to_string();
        if message_type.awaits_ack() {
            self.pending_ack
                .lock()
                .await
                .insert(cid.clone(), task.clone());
        }
        if message_type.awaits_response() {
            self.pending_response.lock().await.insert(cid, task.clone());
        }
    }

    async fn unregister(&self, task: &Arc<SendTask>) {
        let cid = task.correlation_id();
        for table in [&self.pending_ack, &self.pending_response] {
            let mut table = table.lock().await;
            if table.get(cid).is_some_and(|t| Arc::ptr_eq(t, task)) {
                table.remove(cid);
            }
        }
    }

    async fn release_pending(&self, connection_id: ConnectionId) {
        let mut released = Vec::new();
        for table in [&self.pending_ack, &self.pending_response] {
            table.lock().await.retain(|_, task| {
                if task.connection_id() == connection_id {
                    released.push(task.clone());
                    false
                } else {
                    true
                }
            });
        }
        if !released.is_empty() {
            debug!(
                "Releasing {} pending sends of session {} after {} ended",
                released.len(),
                self.id,
                connection_id
            );
        }
        for task in released {
            task.disconnect();
        }
    }

    async fn send_loop(self: Arc<Self>, conn: Arc<Connection>, mut queue: SendQueue) {
        debug!("Send loop started for session {} on {}", self.id, conn.id());

        loop {
            let task = tokio::select! {
                biased;
                _ = conn.closed() => break,
                task = queue.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let Some(outbound) = task.take_outbound() else {
                continue;
            };

            let written = tokio::select! {
                biased;
                _ = conn.closed() => Err(ChannelError::ConnectionClosed),
                result = conn.write_outbound(outbound) => result,
            };

            match written {
                Ok(()) => {
                    trace!(
                        "Sent {} {} on session {}",
                        task.message_type(),
                        task.correlation_id(),
                        self.id
                    );
                    task.mark_transmitted();
                }
                Err(ChannelError::ConnectionClosed) => {
                    task.disconnect();
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to send {} on session {} to {}: {}",
                        task.correlation_id(),
                        self.id,
                        conn.remote_addr(),
                        e
                    );
                    task.fail(e);
                    conn.close();
                    break;
                }
            }
        }

        queue.close();
        while let Ok(task) = queue.try_recv() {
            task.disconnect();
        }
        debug!("Send loop stopped for session {} on {}", self.id, conn.id());
    }

    async fn receive_loop(self: Arc<Self>, conn: Arc<Connection>, mut reader: ConnectionReader) {
        debug!(
            "Receive loop started for session {} on {} from {}",
            self.id,
            conn.id(),
            conn.remote_addr()
        );

        let outcome: Result<()> = loop {
            let frame = tokio::select! {
                biased;
                _ = conn.closed() => break Ok(()),
                frame = reader.read_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(WireError::Closed) => break Ok(()),
                Err(e) => break Err(e.into()),
            };

            let handled = tokio::select! {
                biased;
                _ = conn.closed() => break Ok(()),
                result = self.handle_frame(&conn, &mut reader, frame) => result,
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        match &outcome {
            Ok(()) => info!(
                "Connection {} of session {} to {} ended",
                conn.id(),
                self.id,
                conn.remote_addr()
            ),
            Err(e) => warn!(
                "Connection {} of session {} to {} failed: {}",
                conn.id(),
                self.id,
                conn.remote_addr(),
                e
            ),
        }

        conn.close();
        drop(reader);
        conn.shutdown().await;
        self.release_pending(conn.id()).await;
        self.detach(conn.id()).await;

        if let Some(observer) = self.observer.upgrade() {
            observer.connection_ended(&self.id, conn.id()).await;
        }
    }

    async fn handle_frame(
        &self,
        conn: &Connection,
        reader: &mut ConnectionReader,
        frame: Frame,
    ) -> Result<()> {
        let flagged_streams = frame.header.has_streams();
        let mut message = self.sinks.decode_frame(&frame)?;
        drop(frame);

        trace!(
            "Received {} {} on session {}",
            message.message_type,
            message.correlation_id,
            self.id
        );

        if message.message_type == MessageType::Acknowledge {
            let task = self
                .pending_ack
                .lock()
                .await
                .get(&message.correlation_id)
                .cloned();
            match task {
                Some(task) => task.acknowledge(),
                None => debug!(
                    "No pending send for acknowledge {} on session {}",
                    message.correlation_id, self.id
                ),
            }
            return Ok(());
        }

        let declared = message.stream_count();
        if (declared > 0) != flagged_streams {
            return Err(ChannelError::Protocol(format!(
                "message {} declares {} streams but frame stream flag is {}",
                message.correlation_id, declared, flagged_streams
            )));
        }

        for payload in message.payloads_mut() {
            let Payload::Stream(stream) = payload else {
                continue;
            };
            let len = match stream {
                StreamPayload::Declared(len) => *len,
                _ => continue,
            };
            let received = StreamTransferTask::new(
                &self.config.temp_stream_folder,
                len,
                self.config.max_receive_stream_size,
            )
            .receive(reader)
            .await?;
            *stream = StreamPayload::Received(received);
        }

        if message.message_type.acknowledged_on_receipt() {
            let ack = Message::acknowledge(message.correlation_id.clone());
            let frame = self
                .sinks
                .encode_frame(&ack, self.config.max_send_message_size)?;
            self.write_direct(
                conn,
                Outbound {
                    frame,
                    streams: Vec::new(),
                },
            )
            .await?;
        }

        if message.message_type == MessageType::Response {
            let task = self
                .pending_response
                .lock()
                .await
                .get(&message.correlation_id)
                .cloned();
            match task {
                Some(task) => task.resolve(message),
                None => warn!(
                    "Dropping unmatched response {} on session {}",
                    message.correlation_id, self.id
                ),
            }
            return Ok(());
        }

        self.dispatcher.dispatch(message).await;
        Ok(())
    }
}

impl std::fmt::Debug for SessionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMap")
            .field("id", &self.id)
            .field("reconnectable", &self.is_reconnectable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamSource;
    use crate::transport::IoStream;
    use bytes::Bytes;
    use channel_wire::{FrameBuilder, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
    use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    struct TestObserver {
        received: mpsc::UnboundedSender<Message>,
        ended: mpsc::UnboundedSender<ConnectionId>,
    }

    #[async_trait]
    impl SessionObserver for TestObserver {
        async fn connection_ended(&self, _session_id: &SessionId, connection_id: ConnectionId) {
            let _ = self.ended.send(connection_id);
        }

        async fn message_received(&self, _session_id: SessionId, message: Message) {
            let _ = self.received.send(message);
        }
    }

    struct Harness {
        session: Arc<SessionMap>,
        conn: Arc<Connection>,
        peer: RawPeer,
        received: mpsc::UnboundedReceiver<Message>,
        ended: mpsc::UnboundedReceiver<ConnectionId>,
        _observer: Arc<dyn SessionObserver>,
        _temp: tempfile::TempDir,
    }

    struct RawPeer {
        reader: FrameReader<ReadHalf<IoStream>>,
        writer: FrameWriter<WriteHalf<IoStream>>,
        sinks: SinkSet,
    }

    impl RawPeer {
        async fn recv(&mut self) -> Message {
            let frame = self.reader.read_frame().await.unwrap();
            self.sinks.decode_frame(&frame).unwrap()
        }

        async fn read_stream(&mut self, len: u64) -> Vec<u8> {
            let mut out = Vec::new();
            self.reader.copy_raw(len, &mut out).await.unwrap();
            out
        }

        async fn send(&mut self, mut message: Message) {
            let streams = message.detach_streams(u64::MAX).unwrap();
            let frame = self
                .sinks
                .encode_frame(&message, DEFAULT_MAX_FRAME_SIZE)
                .unwrap();
            self.writer.write_frame(&frame).await.unwrap();
            for mut stream in streams {
                let len = stream.len();
                self.writer.write_raw(&mut stream, len).await.unwrap();
            }
        }

        async fn ack(&mut self, correlation_id: &str) {
            self.send(Message::acknowledge(correlation_id)).await;
        }
    }

    fn harness_with(config: ChannelConfig) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(ChannelConfig {
            temp_stream_folder: temp.path().to_path_buf(),
            ..config
        });
        let (local, remote) = IoStream::memory_pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            64 * 1024,
        );
        let conn = Connection::new(local, config.max_receive_message_size).unwrap();

        let (received_tx, received) = mpsc::unbounded_channel();
        let (ended_tx, ended) = mpsc::unbounded_channel();
        let observer: Arc<dyn SessionObserver> = Arc::new(TestObserver {
            received: received_tx,
            ended: ended_tx,
        });

        let session = SessionMap::new(
            SessionId::new(),
            config,
            SinkSet::default(),
            true,
            Arc::downgrade(&observer),
            conn.clone(),
        );

        let (read_half, write_half) = tokio::io::split(remote);
        Harness {
            session,
            conn,
            peer: RawPeer {
                reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_SIZE),
                writer: FrameWriter::new(write_half),
                sinks: SinkSet::default(),
            },
            received,
            ended,
            _observer: observer,
            _temp: temp,
        }
    }

    async fn started(config: ChannelConfig) -> Harness {
        let h = harness_with(config);
        h.session.start().await;
        h
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_loops_start_once_per_connection() {
        let h = harness_with(ChannelConfig::default());
        assert!(h.session.start_receive().await);
        assert!(h.session.start_send().await);
        assert!(!h.session.start_receive().await);
        assert!(!h.session.start_send().await);
    }

    #[tokio::test]
    async fn test_datagram_acknowledged_and_unregistered() {
        let mut h = started(ChannelConfig::default()).await;

        let session = h.session.clone();
        let send = tokio::spawn(async move {
            session
                .send(Message::datagram("notify").with_correlation_id("d1"), LONG, false)
                .await
        });

        let seen = h.peer.recv().await;
        assert_eq!(seen.correlation_id, "d1");
        assert_eq!(h.session.info().await.pending_acks, 1);
        h.peer.ack("d1").await;

        assert!(send.await.unwrap().unwrap().is_none());
        let info = h.session.info().await;
        assert_eq!(info.pending_acks, 0);
        assert_eq!(info.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_request_resolved_by_matching_response() {
        let mut h = started(ChannelConfig::default()).await;

        let session = h.session.clone();
        let send = tokio::spawn(async move {
            session
                .send(Message::request("echo").with_correlation_id("c1"), LONG, false)
                .await
        });

        let request = h.peer.recv().await;
        assert_eq!(request.message_type, MessageType::Request);
        assert_eq!(h.session.info().await.pending_responses, 1);

        let reply = Message::response_to(&request).with_return_value(Payload::inline("pong"));
        h.peer.send(reply).await;

        let response = send.await.unwrap().unwrap().unwrap();
        assert_eq!(response.correlation_id, "c1");
        assert_eq!(
            response.return_value.as_ref().and_then(Payload::as_inline),
            Some(&Bytes::from_static(b"pong"))
        );

        // the response itself is acknowledged back to the peer
        let ack = h.peer.recv().await;
        assert_eq!(ack.message_type, MessageType::Acknowledge);
        assert_eq!(ack.correlation_id, "c1");

        let info = h.session.info().await;
        assert_eq!(info.pending_responses, 0);
        assert_eq!(info.pending_acks, 0);
    }

    #[tokio::test]
    async fn test_acknowledge_requires_permission() {
        let mut h = started(ChannelConfig::default()).await;

        let result = h.session.send(Message::acknowledge("x"), LONG, false).await;
        assert!(matches!(result, Err(ChannelError::AckNotAllowed)));
        assert_eq!(h.conn.frames_written(), 0);

        let result = h.session.send(Message::acknowledge("x"), LONG, true).await;
        assert!(result.unwrap().is_none());
        assert_eq!(h.peer.recv().await.message_type, MessageType::Acknowledge);
    }

    #[tokio::test]
    async fn test_oneway_returns_without_pending_entries() {
        let mut h = started(ChannelConfig::default()).await;

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            h.session.send(Message::oneway("fire"), LONG, false),
        )
        .await
        .unwrap();
        assert!(result.unwrap().is_none());

        let info = h.session.info().await;
        assert_eq!(info.pending_acks, 0);
        assert_eq!(info.pending_responses, 0);

        let seen = h.peer.recv().await;
        assert_eq!(seen.message_type, MessageType::DatagramOneway);
        assert_eq!(h.session.info().await.pending_acks, 0);
    }

    #[tokio::test]
    async fn test_timeout_closes_connection() {
        let mut h = started(ChannelConfig::default()).await;

        let session = h.session.clone();
        let send = tokio::spawn(async move {
            session
                .send(Message::datagram("slow"), Duration::from_millis(100), false)
                .await
        });

        let _ = h.peer.recv().await;
        let result = send.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Timeout(_))));
        assert!(!h.conn.is_alive());

        let ended = tokio::time::timeout(LONG, h.ended.recv()).await.unwrap();
        assert_eq!(ended, Some(h.conn.id()));
        assert!(!h.session.is_connected().await);
        assert_eq!(h.session.info().await.pending_acks, 0);
    }

    #[tokio::test]
    async fn test_teardown_wakes_blocked_sender() {
        let mut h = started(ChannelConfig::default()).await;

        let session = h.session.clone();
        let send = tokio::spawn(async move {
            session
                .send(Message::request("never"), Duration::from_secs(30), false)
                .await
        });

        let _ = h.peer.recv().await;
        drop(h.peer);

        let result = tokio::time::timeout(LONG, send).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
        assert_eq!(h.session.info().await.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_send_on_dead_connection_fails_fast() {
        let mut h = started(ChannelConfig::default()).await;
        h.session.close().await;
        tokio::time::timeout(LONG, h.ended.recv()).await.unwrap();

        let result = h.session.send(Message::datagram("late"), LONG, false).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversize_stream_rejected_before_any_write() {
        let h = started(ChannelConfig {
            max_send_stream_size: 8,
            ..ChannelConfig::default()
        })
        .await;

        let message = Message::datagram("upload")
            .with_stream(StreamSource::from_bytes(Bytes::from(vec![0u8; 100])));
        let result = h.session.send(message, LONG, false).await;

        assert!(matches!(result, Err(ChannelError::Security(_))));
        assert_eq!(h.conn.frames_written(), 0);
        assert_eq!(h.conn.bytes_written(), 0);
        assert!(h.conn.is_alive());
        assert_eq!(h.session.info().await.pending_acks, 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        let mut h = started(ChannelConfig::default()).await;
        const SENDERS: usize = 16;

        let mut sends = Vec::new();
        for i in 0..SENDERS {
            let session = h.session.clone();
            sends.push(tokio::spawn(async move {
                let fill = i as u8;
                let message = Message::datagram("chunk")
                    .with_correlation_id(format!("s{}", i))
                    .with_inline(Bytes::from(vec![fill; 1000 + i * 700]))
                    .with_stream(StreamSource::from_bytes(Bytes::from(vec![fill; 3000 + i * 311])));
                session.send(message, LONG, false).await
            }));
        }

        let mut expected_bytes = 0u64;
        for _ in 0..SENDERS {
            let frame = h.peer.reader.read_frame().await.unwrap();
            expected_bytes += (channel_wire::LEN_PREFIX_SIZE
                + channel_wire::FRAME_HEADER_SIZE
                + frame.meta_raw.len()
                + frame.body.len()) as u64;
            let message = h.peer.sinks.decode_frame(&frame).unwrap();

            let i: usize = message.correlation_id[1..].parse().unwrap();
            let fill = i as u8;
            let inline = message.parameters[0].as_inline().unwrap();
            assert_eq!(inline.len(), 1000 + i * 700);
            assert!(inline.iter().all(|b| *b == fill));

            let len = 3000 + i as u64 * 311;
            let stream = h.peer.read_stream(len).await;
            assert!(stream.iter().all(|b| *b == fill));
            expected_bytes += len;

            h.peer.ack(&message.correlation_id).await;
        }

        for send in sends {
            assert!(send.await.unwrap().unwrap().is_none());
        }
        assert_eq!(h.conn.frames_written(), SENDERS as u64);
        assert_eq!(h.conn.bytes_written(), expected_bytes);
    }

    #[tokio::test]
    async fn test_inbound_stream_materialized_then_dispatched() {
        let mut h = started(ChannelConfig::default()).await;

        let datagram = Message::datagram("upload")
            .with_correlation_id("up1")
            .with_stream(StreamSource::from_bytes(Bytes::from_static(b"file-bytes")));
        h.peer.send(datagram).await;

        let ack = h.peer.recv().await;
        assert_eq!(ack.message_type, MessageType::Acknowledge);
        assert_eq!(ack.correlation_id, "up1");

        let mut message = tokio::time::timeout(LONG, h.received.recv())
            .await
            .unwrap()
            .unwrap();
        let received = message.parameters[0].as_received_mut().unwrap();
        let path = received.path().to_path_buf();
        let mut content = Vec::new();
        received.read_to_end(&mut content).await.unwrap();
        assert_eq!(&content[..], b"file-bytes");

        drop(message);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dispatch_preserves_receipt_order() {
        let mut h = started(ChannelConfig::default()).await;

        for i in 0..10 {
            h.peer
                .send(Message::oneway("tick").with_correlation_id(format!("o{}", i)))
                .await;
        }
        for i in 0..10 {
            let message = tokio::time::timeout(LONG, h.received.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.correlation_id, format!("o{}", i));
        }
    }

    #[tokio::test]
    async fn test_unknown_sink_ends_connection() {
        let mut h = started(ChannelConfig::default()).await;

        let frame = FrameBuilder::new(77)
            .body(Bytes::from_static(b"??"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        h.peer.writer.write_frame(&frame).await.unwrap();

        let ended = tokio::time::timeout(LONG, h.ended.recv()).await.unwrap();
        assert_eq!(ended, Some(h.conn.id()));
        assert!(!h.session.is_connected().await);
    }

    #[tokio::test]
    async fn test_oversize_inbound_stream_ends_connection() {
        let mut h = started(ChannelConfig {
            max_receive_stream_size: 4,
            ..ChannelConfig::default()
        })
        .await;
        let folder = h.session.config.temp_stream_folder.clone();

        let datagram = Message::datagram("upload")
            .with_stream(StreamSource::from_bytes(Bytes::from(vec![1u8; 64])));
        h.peer.send(datagram).await;

        tokio::time::timeout(LONG, h.ended.recv()).await.unwrap();
        assert!(h.received.try_recv().is_err());
        assert_eq!(std::fs::read_dir(folder).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_later_stream_failure_removes_earlier_files() {
        let mut h = started(ChannelConfig {
            max_receive_stream_size: 8,
            ..ChannelConfig::default()
        })
        .await;
        let folder = h.session.config.temp_stream_folder.clone();

        let request = Message::request("upload")
            .with_correlation_id("two-streams")
            .with_stream(StreamSource::from_bytes(Bytes::from_static(b"fits")))
            .with_stream(StreamSource::from_bytes(Bytes::from(vec![7u8; 64])));
        h.peer.send(request).await;

        tokio::time::timeout(LONG, h.ended.recv()).await.unwrap();
        assert!(!h.session.is_connected().await);
        assert!(h.received.try_recv().is_err());
        assert_eq!(std::fs::read_dir(folder).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let mut h = started(ChannelConfig::default()).await;

        let stray = Message::response_to(&Message::request("gone").with_correlation_id("late"));
        h.peer.send(stray).await;

        // still acknowledged, connection stays up
        let ack = h.peer.recv().await;
        assert_eq!(ack.correlation_id, "late");
        assert!(h.session.is_connected().await);
        assert!(h.received.try_recv().is_err());
    }
}
