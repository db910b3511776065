//! Message sinks: pluggable serializers selected by id.
//!
//! A sink turns a [`Message`] into a body and back. Stream payloads appear in
//! the body only as their declared length. [`SinkSet`] picks the sink on the
//! send side, wraps the body in a frame with its metadata, and routes inbound
//! frames to the sink named by their header.

use crate::error::{ChannelError, Result};
use crate::message::{Message, MessageType, Payload, StreamPayload};
use bytes::Bytes;
use channel_wire::{get_meta_str, parse_meta, Frame, FrameBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Id of the CBOR sink
pub const CBOR_SINK_ID: u16 = 1;

/// Id of the JSON sink
pub const JSON_SINK_ID: u16 = 2;

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink cannot represent this message; the next sink may
    #[error("format not supported by sink: {0}")]
    Format(String),

    /// Serialization failed for a reason another sink would not fix
    #[error("encode failed: {0}")]
    Encode(String),

    /// Body could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// Every configured sink declined the message
    #[error("no sink could serialize the message")]
    NoSink,
}

/// Serializer/deserializer pair identified on the wire by `id`
pub trait MessageSink: Send + Sync + fmt::Debug {
    /// Wire id written into each frame header
    fn id(&self) -> u16;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Serialize a message whose streams are already detached
    fn serialize(&self, message: &Message) -> std::result::Result<Bytes, SinkError>;

    /// Deserialize a body produced by the same sink on the peer
    fn deserialize(&self, body: &[u8]) -> std::result::Result<Message, SinkError>;
}

#[derive(Serialize, Deserialize)]
enum WirePayload {
    #[serde(rename = "i")]
    Inline(Bytes),
    #[serde(rename = "s")]
    Stream(u64),
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "t")]
    message_type: MessageType,
    #[serde(rename = "c")]
    correlation_id: String,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(rename = "p", default)]
    parameters: Vec<WirePayload>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    return_value: Option<WirePayload>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "x", default)]
    parallel: bool,
}

impl WirePayload {
    fn from_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Inline(bytes) => WirePayload::Inline(bytes.clone()),
            Payload::Stream(stream) => WirePayload::Stream(stream.len()),
        }
    }

    fn into_payload(self) -> Payload {
        match self {
            WirePayload::Inline(bytes) => Payload::Inline(bytes),
            WirePayload::Stream(len) => Payload::Stream(StreamPayload::Declared(len)),
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_type: message.message_type,
            correlation_id: message.correlation_id.clone(),
            method: message.method.clone(),
            parameters: message
                .parameters
                .iter()
                .map(WirePayload::from_payload)
                .collect(),
            return_value: message.return_value.as_ref().map(WirePayload::from_payload),
            error: message.error.clone(),
            parallel: message.parallel,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Message {
            message_type: wire.message_type,
            correlation_id: wire.correlation_id,
            method: wire.method,
            parameters: wire
                .parameters
                .into_iter()
                .map(WirePayload::into_payload)
                .collect(),
            return_value: wire.return_value.map(WirePayload::into_payload),
            error: wire.error,
            parallel: wire.parallel,
        }
    }
}

/// Compact binary sink
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSink;

impl MessageSink for CborSink {
    fn id(&self) -> u16 {
        CBOR_SINK_ID
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize(&self, message: &Message) -> std::result::Result<Bytes, SinkError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&WireMessage::from(message), &mut buf).map_err(|e| match e {
            ciborium::ser::Error::Value(msg) => SinkError::Format(msg),
            ciborium::ser::Error::Io(io) => SinkError::Encode(io.to_string()),
        })?;
        Ok(Bytes::from(buf))
    }

    fn deserialize(&self, body: &[u8]) -> std::result::Result<Message, SinkError> {
        let wire: WireMessage =
            ciborium::from_reader(body).map_err(|e| SinkError::Decode(e.to_string()))?;
        Ok(wire.into())
    }
}

/// Text sink, handy when inspecting traffic
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

impl MessageSink for JsonSink {
    fn id(&self) -> u16 {
        JSON_SINK_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, message: &Message) -> std::result::Result<Bytes, SinkError> {
        serde_json::to_vec(&WireMessage::from(message))
            .map(Bytes::from)
            .map_err(|e| {
                if e.is_io() {
                    SinkError::Encode(e.to_string())
                } else {
                    SinkError::Format(e.to_string())
                }
            })
    }

    fn deserialize(&self, body: &[u8]) -> std::result::Result<Message, SinkError> {
        let wire: WireMessage =
            serde_json::from_slice(body).map_err(|e| SinkError::Decode(e.to_string()))?;
        Ok(wire.into())
    }
}

/// Ordered send sinks plus the receive sinks looked up by id
#[derive(Debug, Clone)]
pub struct SinkSet {
    send: Vec<Arc<dyn MessageSink>>,
    receive: Vec<Arc<dyn MessageSink>>,
}

impl SinkSet {
    /// Build from explicit send and receive lists
    pub fn new(send: Vec<Arc<dyn MessageSink>>, receive: Vec<Arc<dyn MessageSink>>) -> Self {
        Self { send, receive }
    }

    /// Find the receive sink with the given id
    pub fn find(&self, sink_id: u16) -> Option<&Arc<dyn MessageSink>> {
        self.receive.iter().find(|sink| sink.id() == sink_id)
    }

    /// Serialize with the first send sink that accepts the message
    pub fn serialize(&self, message: &Message) -> std::result::Result<(u16, Bytes), SinkError> {
        for sink in &self.send {
            match sink.serialize(message) {
                Ok(body) => return Ok((sink.id(), body)),
                Err(SinkError::Format(reason)) => {
                    debug!(
                        "Sink {} declined message {}: {}",
                        sink.name(),
                        message.correlation_id,
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(SinkError::NoSink)
    }

    /// Serialize and frame a message whose streams are already detached
    pub fn encode_frame(&self, message: &Message, max_frame_size: usize) -> Result<Bytes> {
        let (sink_id, body) = self.serialize(message)?;
        let stream_count = message.stream_count();

        let mut builder = FrameBuilder::new(sink_id)
            .with_checksum()
            .meta_insert_str("cid", &message.correlation_id)
            .meta_insert_str("type", message.message_type.as_str())
            .meta_insert_u64("streams", stream_count as u64)
            .body(body);
        if stream_count > 0 {
            builder = builder.with_streams();
        }

        let frame = builder.build(max_frame_size)?;
        trace!(
            "Encoded {} {} with sink {} ({} bytes)",
            message.message_type,
            message.correlation_id,
            sink_id,
            frame.len()
        );
        Ok(frame)
    }

    /// Deserialize a frame with the sink its header names.
    ///
    /// An unknown sink id means the peer speaks another protocol.
    pub fn decode_frame(&self, frame: &Frame) -> Result<Message> {
        let sink_id = frame.header.sink_id;
        let sink = self.find(sink_id).ok_or(ChannelError::UnknownSink(sink_id))?;

        sink.deserialize(&frame.body).map_err(|e| {
            let cid = parse_meta(&frame.meta_raw)
                .ok()
                .and_then(|meta| get_meta_str(&meta, "cid"))
                .unwrap_or_default();
            debug!("Sink {} failed to decode message {}: {}", sink.name(), cid, e);
            ChannelError::Sink(e)
        })
    }
}

impl Default for SinkSet {
    fn default() -> Self {
        let sinks: Vec<Arc<dyn MessageSink>> = vec![Arc::new(CborSink), Arc::new(JsonSink)];
        Self::new(sinks.clone(), sinks)
    }
}
