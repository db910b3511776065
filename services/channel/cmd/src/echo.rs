//! Echo handler used when the node serves.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use channel_session::{Message, MessageHandler, MessageType, Payload, SessionId, StreamPayload};

/// Answers every Request with its inline parameters concatenated.
///
/// Stream parameters are drained and show up in the reply as
/// `<stream N bytes>`.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl EchoHandler {
    async fn echo_body(message: &mut Message) -> std::io::Result<Bytes> {
        let mut body = BytesMut::new();
        for payload in message.parameters.iter_mut() {
            match payload {
                Payload::Inline(bytes) => body.put_slice(bytes),
                Payload::Stream(StreamPayload::Received(stream)) => {
                    let len = tokio::io::copy(stream, &mut tokio::io::sink()).await?;
                    body.put_slice(format!("<stream {} bytes>", len).as_bytes());
                }
                Payload::Stream(other) => {
                    body.put_slice(format!("<stream {} bytes>", other.len()).as_bytes());
                }
            }
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(
        &self,
        session_id: &SessionId,
        mut message: Message,
    ) -> anyhow::Result<Option<Message>> {
        let body = Self::echo_body(&mut message).await?;

        if message.message_type != MessageType::Request {
            crate::component_info!(
                "server",
                "{} {} from session {}: {} bytes",
                message.message_type,
                message.correlation_id,
                session_id,
                body.len()
            );
            return Ok(None);
        }

        crate::component_debug!(
            "server",
            "Echoing request {} from session {} ({} bytes)",
            message.correlation_id,
            session_id,
            body.len()
        );
        Ok(Some(
            Message::response_to(&message).with_return_value(Payload::inline(body)),
        ))
    }
}
