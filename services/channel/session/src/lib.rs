//! TCP sessions, send/recv loops, ACK/response correlation, stream transfer
//! and reconnect for the RPC channel.
//!
//! This crate provides the session engine of the channel: a session owns one
//! live connection at a time, serializes concurrent senders onto it, tracks
//! sends awaiting an Acknowledge or a Response, enforces timeouts, and
//! survives reconnection under the same session id.
//!
//! ## Features
//!
//! - **Session Map**: Sender and receiver loops per connection
//! - **Correlation**: Pending-ack and pending-response tables keyed by correlation id
//! - **Timeouts**: A send timeout tears the connection down
//! - **Side-Channel Streams**: Raw stream bytes after a frame, materialized into temp files
//! - **Reconnect**: Self-initiated sessions are revived on a new connection
//! - **Ordered Dispatch**: Received messages delivered in receipt order
//!
//! ## Example
//!
//! ```rust,no_run
//! use channel_session::{ChannelConfig, Message, RpcChannel, TcpChannel};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let channel = TcpChannel::new(ChannelConfig::default())?;
//! let session_id = channel.connect_to("127.0.0.1:9000".parse()?).await?;
//!
//! let request = Message::request("echo").with_inline("hello");
//! if let Some(response) = channel
//!     .send_message(&session_id, request, Some(Duration::from_secs(5)))
//!     .await?
//! {
//!     println!("Response {} error={:?}", response.correlation_id, response.error);
//! }
//!
//! channel.disconnect(&session_id).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod ids;
pub mod message;
pub mod send_task;
pub mod session_map;
pub mod signal;
pub mod sink;
pub mod stream_transfer;
pub mod transport;

// Re-export main types
pub use channel::{ChannelEvent, MessageHandler, RpcChannel, TcpChannel, NO_HANDLER_ERROR};
pub use config::{ChannelConfig, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_STREAM_SIZE};
pub use connection::Connection;
pub use error::{ChannelError, Result};
pub use ids::{ConnectionId, SessionId};
pub use message::{Message, MessageType, Payload, StreamPayload, StreamSource};
pub use send_task::{Outbound, SendTask};
pub use session_map::{SessionInfo, SessionMap, SessionObserver};
pub use sink::{CborSink, JsonSink, MessageSink, SinkError, SinkSet, CBOR_SINK_ID, JSON_SINK_ID};
pub use stream_transfer::{ReceivedStream, StreamTransferTask, STREAM_FILE_PREFIX};
pub use transport::{connect_tcp, listen_tcp, Connector, IoStream, TcpConnector};
