//! Error types for sessions and the channel registry.

use crate::ids::SessionId;
use crate::sink::SinkError;
use channel_wire::{CodecError, WireError};
use std::time::Duration;
use thiserror::Error;

/// Channel and session errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No acknowledge or response arrived in time; the connection was torn down
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The connection ended while the send was in flight
    #[error("connection closed")]
    ConnectionClosed,

    /// Session is unknown, or dead and not reconnectable
    #[error("connection not found for session {0}")]
    ConnectionNotFound(SessionId),

    /// A stream exceeded the configured size limit
    #[error("security violation: {0}")]
    Security(String),

    /// Acknowledge messages are reserved for the receive loop
    #[error("acknowledge messages cannot be sent by callers")]
    AckNotAllowed,

    /// Peer framed a message with a sink this side does not know
    #[error("unknown sink id {0}")]
    UnknownSink(u16),

    /// Peer broke the framing contract
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Message cannot be sent in its current shape
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// I/O failure, including send failures captured on a task
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Frame building error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serialization error
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChannelError {
    /// Wrap a failure captured during transmission as an I/O error
    pub(crate) fn into_io(self) -> Self {
        match self {
            ChannelError::Io(_) => self,
            other => ChannelError::Io(std::io::Error::other(other)),
        }
    }
}

/// Result alias for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
