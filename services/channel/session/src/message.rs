//! Message model carried over a session.
//!
//! A [`Message`] holds inline parameters and, optionally, streams. Streams
//! never travel inside the serialized body: before a send they are detached
//! and replaced by their declared length, and the raw bytes follow the frame
//! on the wire. On receipt each declared length is materialized into a
//! temp-file backed [`ReceivedStream`].

use crate::error::{ChannelError, Result};
use crate::stream_transfer::ReceivedStream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Kind of message, which decides how it is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Call expecting a Response
    Request,
    /// Answer to a Request; acknowledged by the requester
    Response,
    /// Fire-and-confirm message; acknowledged on receipt
    Datagram,
    /// Fire-and-forget message; never acknowledged
    DatagramOneway,
    /// Receipt confirmation for a Response or Datagram
    Acknowledge,
}

impl MessageType {
    /// Sender waits for an Acknowledge (or, for Requests, the Response)
    pub fn awaits_ack(self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::Response | MessageType::Datagram
        )
    }

    /// Sender waits for a Response
    pub fn awaits_response(self) -> bool {
        self == MessageType::Request
    }

    /// Receiver answers with an Acknowledge as soon as the message is read
    pub fn acknowledged_on_receipt(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Datagram)
    }

    /// Short lowercase name used in frame metadata and logs
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Datagram => "datagram",
            MessageType::DatagramOneway => "datagram_oneway",
            MessageType::Acknowledge => "acknowledge",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local byte source with a declared length, to be sent as a side-channel stream
pub struct StreamSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    len: u64,
}

impl StreamSource {
    /// Wrap any reader that will yield exactly `len` bytes
    pub fn from_reader<R>(reader: R, len: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    /// Stream in-memory bytes
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self::from_reader(Cursor::new(bytes), len)
    }

    /// Stream a file; the length is taken from its metadata
    pub async fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::from_reader(file, len))
    }

    /// Declared length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsyncRead for StreamSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource").field("len", &self.len).finish()
    }
}

/// Stream-typed payload in one of its three lifecycle states
#[derive(Debug)]
pub enum StreamPayload {
    /// Outbound bytes not yet sent
    Source(StreamSource),
    /// In-band size marker; bytes follow the frame on the wire
    Declared(u64),
    /// Inbound bytes materialized in temp storage
    Received(ReceivedStream),
}

impl StreamPayload {
    /// Length of the stream in bytes
    pub fn len(&self) -> u64 {
        match self {
            StreamPayload::Source(source) => source.len(),
            StreamPayload::Declared(len) => *len,
            StreamPayload::Received(received) => received.len(),
        }
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A parameter or return value
#[derive(Debug)]
pub enum Payload {
    /// Bytes carried inside the serialized message
    Inline(Bytes),
    /// Bytes carried on the side channel
    Stream(StreamPayload),
}

impl Payload {
    /// Inline payload from anything convertible to `Bytes`
    pub fn inline(bytes: impl Into<Bytes>) -> Self {
        Payload::Inline(bytes.into())
    }

    /// Outbound stream payload
    pub fn stream(source: StreamSource) -> Self {
        Payload::Stream(StreamPayload::Source(source))
    }

    /// Inline bytes, if this payload is inline
    pub fn as_inline(&self) -> Option<&Bytes> {
        match self {
            Payload::Inline(bytes) => Some(bytes),
            Payload::Stream(_) => None,
        }
    }

    /// Received stream handle, if this payload was materialized on receipt
    pub fn as_received_mut(&mut self) -> Option<&mut ReceivedStream> {
        match self {
            Payload::Stream(StreamPayload::Received(received)) => Some(received),
            _ => None,
        }
    }
}

/// Application message exchanged over a session
#[derive(Debug)]
pub struct Message {
    /// Message kind
    pub message_type: MessageType,
    /// Links a Request to its Response, or a Response/Datagram to its Acknowledge
    pub correlation_id: String,
    /// Method name for Requests and Datagrams
    pub method: Option<String>,
    /// Ordered parameters
    pub parameters: Vec<Payload>,
    /// Return value of a Response
    pub return_value: Option<Payload>,
    /// Remote failure carried by a Response
    pub error: Option<String>,
    /// May be dispatched concurrently with other messages of the session
    pub parallel: bool,
}

impl Message {
    fn new(message_type: MessageType, correlation_id: String) -> Self {
        Self {
            message_type,
            correlation_id,
            method: None,
            parameters: Vec::new(),
            return_value: None,
            error: None,
            parallel: false,
        }
    }

    fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Request for `method`
    pub fn request(method: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::Request, Self::fresh_id());
        message.method = Some(method.into());
        message
    }

    /// Acknowledged datagram for `method`
    pub fn datagram(method: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::Datagram, Self::fresh_id());
        message.method = Some(method.into());
        message
    }

    /// One-way datagram for `method`
    pub fn oneway(method: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::DatagramOneway, Self::fresh_id());
        message.method = Some(method.into());
        message
    }

    /// Empty Response to `request`
    pub fn response_to(request: &Message) -> Self {
        let mut message = Self::new(MessageType::Response, request.correlation_id.clone());
        message.method = request.method.clone();
        message
    }

    /// Error Response to `request`
    pub fn error_response_to(request: &Message, error: impl Into<String>) -> Self {
        let mut message = Self::response_to(request);
        message.error = Some(error.into());
        message
    }

    /// Acknowledge for `correlation_id`
    pub fn acknowledge(correlation_id: impl Into<String>) -> Self {
        Self::new(MessageType::Acknowledge, correlation_id.into())
    }

    /// Replace the generated correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Append a parameter
    pub fn with_parameter(mut self, payload: Payload) -> Self {
        self.parameters.push(payload);
        self
    }

    /// Append an inline parameter
    pub fn with_inline(self, bytes: impl Into<Bytes>) -> Self {
        self.with_parameter(Payload::inline(bytes))
    }

    /// Append a stream parameter
    pub fn with_stream(self, source: StreamSource) -> Self {
        self.with_parameter(Payload::stream(source))
    }

    /// Set the return value
    pub fn with_return_value(mut self, payload: Payload) -> Self {
        self.return_value = Some(payload);
        self
    }

    /// Mark the message as eligible for concurrent dispatch
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Whether this Response reports a remote failure
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Every payload slot, parameters first, then the return value
    pub(crate) fn payloads_mut(&mut self) -> impl Iterator<Item = &mut Payload> {
        self.parameters.iter_mut().chain(self.return_value.iter_mut())
    }

    fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.parameters.iter().chain(self.return_value.iter())
    }

    /// Number of stream payloads, in any state
    pub fn stream_count(&self) -> usize {
        self.payloads()
            .filter(|p| matches!(p, Payload::Stream(_)))
            .count()
    }

    /// Detach every stream for side-channel transfer.
    ///
    /// Each stream is checked against `max_stream_size` before anything is
    /// detached, then replaced by a size marker. Received streams are turned
    /// back into sources so they can be forwarded.
    pub(crate) fn detach_streams(&mut self, max_stream_size: u64) -> Result<Vec<StreamSource>> {
        for payload in self.payloads() {
            if let Payload::Stream(stream) = payload {
                if let StreamPayload::Declared(_) = stream {
                    return Err(ChannelError::InvalidMessage(
                        "stream payload has no local source".to_string(),
                    ));
                }
                if stream.len() > max_stream_size {
                    return Err(ChannelError::Security(format!(
                        "stream of {} bytes exceeds max send stream size {}",
                        stream.len(),
                        max_stream_size
                    )));
                }
            }
        }

        let mut sources = Vec::new();
        for payload in self.payloads_mut() {
            if let Payload::Stream(stream) = payload {
                let len = stream.len();
                match std::mem::replace(stream, StreamPayload::Declared(len)) {
                    StreamPayload::Source(source) => sources.push(source),
                    StreamPayload::Received(received) => sources.push(received.into_source()),
                    StreamPayload::Declared(_) => {}
                }
            }
        }
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_rules() {
        assert!(MessageType::Request.awaits_ack());
        assert!(MessageType::Request.awaits_response());
        assert!(!MessageType::Request.acknowledged_on_receipt());
        assert!(MessageType::Datagram.acknowledged_on_receipt());
        assert!(MessageType::Response.acknowledged_on_receipt());
        assert!(!MessageType::DatagramOneway.awaits_ack());
        assert!(!MessageType::Acknowledge.awaits_ack());
    }

    #[test]
    fn test_response_keeps_correlation() {
        let request = Message::request("echo").with_correlation_id("c1");
        let response = Message::response_to(&request);
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.correlation_id, "c1");

        let failed = Message::error_response_to(&request, "boom");
        assert!(failed.is_error());
        assert_eq!(failed.correlation_id, "c1");
    }

    #[test]
    fn test_detach_streams_replaces_with_markers() {
        let mut message = Message::request("upload")
            .with_inline(Bytes::from_static(b"name"))
            .with_stream(StreamSource::from_bytes(Bytes::from_static(b"0123456789")))
            .with_return_value(Payload::stream(StreamSource::from_bytes(Bytes::from_static(
                b"abc",
            ))));

        let sources = message.detach_streams(64).unwrap();
        assert_eq!(sources.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![10, 3]);
        assert!(matches!(
            message.parameters[1],
            Payload::Stream(StreamPayload::Declared(10))
        ));
        assert!(matches!(
            message.return_value,
            Some(Payload::Stream(StreamPayload::Declared(3)))
        ));
        assert_eq!(message.stream_count(), 2);
    }

    #[test]
    fn test_detach_streams_rejects_oversize_before_detaching() {
        let mut message = Message::datagram("upload")
            .with_stream(StreamSource::from_bytes(Bytes::from_static(b"ok")))
            .with_stream(StreamSource::from_bytes(Bytes::from(vec![0u8; 100])));

        let result = message.detach_streams(10);
        assert!(matches!(result, Err(ChannelError::Security(_))));
        assert!(matches!(
            message.parameters[0],
            Payload::Stream(StreamPayload::Source(_))
        ));
    }

    #[test]
    fn test_detach_rejects_bare_marker() {
        let mut message =
            Message::datagram("x").with_parameter(Payload::Stream(StreamPayload::Declared(4)));
        assert!(matches!(
            message.detach_streams(10),
            Err(ChannelError::InvalidMessage(_))
        ));
    }
}
